//! PAC script generation.
//!
//! A rendered script is the user's template with its `FindProxyForURL`
//! renamed to `MyFindProxyForURL`, followed by a `sites` object holding the
//! domain list and a wrapper `FindProxyForURL` that consults both. Proxy
//! directives point at [`PLACEHOLDER_HOST`] until [`rewrite_placeholder`]
//! swaps in the address the client actually used.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{NoExpand, Regex};

use crate::error::{Error, Result};

/// Loopback address standing in for this server inside cached scripts.
pub const PLACEHOLDER_HOST: &str = "127.0.1.2";

const FIND_PROXY_DECL: &str = "function FindProxyForURL(";
const RENAMED_DECL: &str = "function MyFindProxyForURL(";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = format!(r"PROXY {}:\d+", regex::escape(PLACEHOLDER_HOST));
    Regex::new(&pattern).expect("placeholder pattern is valid")
});

static WRAPPER: LazyLock<String> = LazyLock::new(|| {
    format!(
        r#"
if (typeof whiteList !== 'undefined') {{
    for (var i in whiteList) {{
        delete sites[whiteList[i]];
    }}
}}
function FindProxyForURL(url, host) {{
    var p = MyFindProxyForURL(url, host);
    if (p != "DIRECT") {{
        return p;
    }}

    var lastPos;
    do {{
        if (sites.hasOwnProperty(host)) {{
            return 'PROXY {PLACEHOLDER_HOST}:8087';
        }}
        lastPos = host.indexOf('.') + 1;
        host = host.slice(lastPos);
    }} while (lastPos >= 1);
    return 'DIRECT';
}}
"#
    )
});

/// The template written for a PAC path that has none yet.
pub fn default_template(port: &str) -> String {
    format!(
        r#"// User-defined FindProxyForURL
var whiteList = new Array(
    // "example.com",
);
function FindProxyForURL(url, host) {{
    if (isPlainHostName(host) ||
        isInNet(host, "10.0.0.0", "255.0.0.0") ||
        isInNet(host, "172.16.0.0", "255.240.0.0") ||
        isInNet(host, "169.254.0.0", "255.255.0.0") ||
        isInNet(host, "192.168.0.0", "255.255.0.0") ||
        isInNet(host, "127.0.0.0", "255.255.255.0") ||
        shExpMatch(host, "*.local") ||
        shExpMatch(host, 'localhost.*')) {{
        return 'DIRECT';
    }}

    if (shExpMatch(host, '*.google*.*')) {{
        return 'PROXY {PLACEHOLDER_HOST}:{port}';
    }}

    return 'DIRECT';
}}
"#
    )
}

/// Build the full PAC script from a base template and the domain list.
pub fn render(template: &str, domains: &[String]) -> Result<String> {
    let pos = template
        .find(FIND_PROXY_DECL)
        .ok_or_else(|| Error::Render("template does not define FindProxyForURL".into()))?;

    let sites_len: usize = domains.iter().map(|d| d.len() + 5).sum();
    let mut out = String::with_capacity(template.len() + sites_len + WRAPPER.len() + 32);

    out.push_str(&template[..pos]);
    out.push_str(RENAMED_DECL);
    out.push_str(&template[pos + FIND_PROXY_DECL.len()..]);

    out.push_str("\nvar sites = {\n");
    for (i, domain) in domains.iter().enumerate() {
        if i != 0 {
            out.push_str(",\n");
        }
        let key = serde_json::to_string(domain).map_err(|e| Error::Render(e.to_string()))?;
        out.push_str(&key);
        out.push_str(":1");
    }
    out.push_str("\n};\n");
    out.push_str(&WRAPPER);

    Ok(out)
}

/// Point every placeholder proxy directive at `authority` (`host:port`).
pub fn rewrite_placeholder<'a>(body: &'a str, authority: &str) -> Cow<'a, str> {
    PLACEHOLDER.replace_all(body, NoExpand(&format!("PROXY {authority}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::{Context, Source};

    const DIRECT_TEMPLATE: &str = "function FindProxyForURL(url, host) {\n    return 'DIRECT';\n}\n";

    fn sites_of(script: &str) -> Vec<String> {
        let start = script.find("var sites = {\n").unwrap() + "var sites = {\n".len();
        let end = start + script[start..].find("\n};").unwrap();
        script[start..end]
            .split(",\n")
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let key = entry.strip_suffix(":1").unwrap();
                serde_json::from_str::<String>(key).unwrap()
            })
            .collect()
    }

    /// The PAC helpers browsers provide, enough for the default template.
    const PAC_HELPERS: &str = r#"
function isPlainHostName(host) { return host.indexOf('.') < 0; }
function isInNet(host, pattern, mask) { return false; }
function shExpMatch(str, shexp) {
    var re = shexp.replace(/[.+^${}()|[\]\\]/g, '\\$&').replace(/\*/g, '.*').replace(/\?/g, '.');
    return new RegExp('^' + re + '$').test(str);
}
"#;

    /// Evaluate `script` and call its `FindProxyForURL` once per host.
    fn run_pac(script: &str, hosts: &[&str]) -> Vec<String> {
        let mut context = Context::default();
        context.eval(Source::from_bytes(PAC_HELPERS)).unwrap();
        context.eval(Source::from_bytes(script)).unwrap();

        hosts
            .iter()
            .map(|host| {
                let call = format!("FindProxyForURL('http://{host}/', '{host}')");
                let value = context.eval(Source::from_bytes(&call)).unwrap();
                value.as_string().unwrap().to_std_string_escaped()
            })
            .collect()
    }

    #[test]
    fn render_renames_base_function_once() {
        let script = render(DIRECT_TEMPLATE, &["example.com".into()]).unwrap();

        assert!(script.starts_with("function MyFindProxyForURL(url, host)"));
        assert_eq!(script.matches("function FindProxyForURL(").count(), 1);
        assert_eq!(script.matches("function MyFindProxyForURL(").count(), 1);
    }

    #[test]
    fn render_embeds_every_domain() {
        let domains = vec!["a.com".to_string(), "b.org".to_string()];
        let script = render(DIRECT_TEMPLATE, &domains).unwrap();

        assert_eq!(sites_of(&script), domains);
    }

    #[test]
    fn render_with_empty_list_is_valid() {
        let script = render(DIRECT_TEMPLATE, &[]).unwrap();

        assert!(sites_of(&script).is_empty());
        assert!(script.contains("var sites = {\n\n};"));
    }

    #[test]
    fn generated_lookup_proxies_subdomains_only() {
        let script = render(DIRECT_TEMPLATE, &["example.com".into()]).unwrap();

        assert_eq!(
            run_pac(&script, &["sub.example.com", "example.com", "example.org", "notexample.com"]),
            ["PROXY 127.0.1.2:8087", "PROXY 127.0.1.2:8087", "DIRECT", "DIRECT"]
        );
    }

    #[test]
    fn default_template_script_routes_after_rewrite() {
        let template = default_template("8087").replace(r#"// "example.com","#, r#""exact.example.net""#);
        let domains = vec!["example.com".to_string(), "exact.example.net".to_string()];
        let script = render(&template, &domains).unwrap();
        let script = rewrite_placeholder(&script, "gw.lan:9090");

        let answers = run_pac(
            &script,
            &[
                "sub.example.com",
                "example.org",
                "exact.example.net",
                "foo.local",
                "intranet",
                "www.google.com",
            ],
        );

        assert_eq!(
            answers,
            [
                "PROXY gw.lan:9090",
                "DIRECT",
                "DIRECT",
                "DIRECT",
                "DIRECT",
                "PROXY gw.lan:9090",
            ]
        );
    }

    #[test]
    fn placeholder_spellings_agree() {
        let script = render(&default_template("3128"), &["example.com".into()]).unwrap();

        assert_eq!(PLACEHOLDER.find_iter(&script).count(), 2);
        assert!(!rewrite_placeholder(&script, "gw.lan:1").contains(PLACEHOLDER_HOST));
    }

    #[test]
    fn render_escapes_domain_strings() {
        let script = render(DIRECT_TEMPLATE, &["we\"ird.com".into()]).unwrap();

        assert!(script.contains(r#""we\"ird.com":1"#));
    }

    #[test]
    fn render_rejects_template_without_entry_point() {
        let err = render("var x = 1;", &[]).unwrap_err();

        assert!(matches!(err, Error::Render(_)));
    }

    #[test]
    fn default_template_uses_placeholder_and_port() {
        let template = default_template("8087");

        assert!(template.contains("return 'PROXY 127.0.1.2:8087';"));
        assert!(template.contains("var whiteList = new Array("));
        assert!(template.contains(FIND_PROXY_DECL));
    }

    #[test]
    fn rewrite_replaces_every_placeholder_port() {
        let body = "a 'PROXY 127.0.1.2:8087' b 'PROXY 127.0.1.2:1' c 'PROXY 10.0.0.1:3128'";

        let rewritten = rewrite_placeholder(body, "gw.lan:9090");

        assert_eq!(
            rewritten,
            "a 'PROXY gw.lan:9090' b 'PROXY gw.lan:9090' c 'PROXY 10.0.0.1:3128'"
        );
        assert!(!rewritten.contains(PLACEHOLDER_HOST));
    }

    #[test]
    fn rewrite_does_not_expand_dollar_signs() {
        assert_eq!(rewrite_placeholder("PROXY 127.0.1.2:80", "$1:80"), "PROXY $1:80");
    }
}
