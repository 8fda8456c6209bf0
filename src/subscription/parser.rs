//! 订阅内容解析器
//!
//! 支持以下订阅格式：
//! - **URI 列表**: `vless://`, `vmess://`, `trojan://`
//! - **Base64 编码**的 URI 列表
//! - **Clash YAML**: 顶层 `proxies:` 列表
//! - **JSON 数组**: 节点记录数组

use anyhow::Result;
use base64::Engine;
use tracing::debug;

use super::node::{Node, TlsField};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SubFormat {
    Links,
    Base64,
    ClashYaml,
    Json,
    Empty,
    Unknown,
}

/// 检测订阅内容格式
pub fn detect_format(content: &str) -> SubFormat {
    let content = content.trim();
    if content.is_empty() {
        return SubFormat::Empty;
    }
    if content.starts_with("proxies:")
        || content.starts_with("proxy-groups:")
        || content.starts_with("---")
        || content.contains("\nproxies:")
    {
        return SubFormat::ClashYaml;
    }
    if content.starts_with('{') || content.starts_with('[') {
        return SubFormat::Json;
    }
    if ["vless://", "vmess://", "trojan://"]
        .iter()
        .any(|p| content.contains(p))
    {
        return SubFormat::Links;
    }
    if let Ok(decoded) = decode_base64_content(content) {
        if ["vless://", "vmess://", "trojan://"]
            .iter()
            .any(|p| decoded.contains(p))
        {
            return SubFormat::Base64;
        }
    }
    SubFormat::Unknown
}

/// 自动检测格式并解析订阅内容
pub fn parse_subscription(content: &str) -> Result<Vec<Node>> {
    match detect_format(content) {
        SubFormat::Links => Ok(parse_links_content(content)),
        SubFormat::Base64 => {
            let decoded = decode_base64_content(content)?;
            Ok(parse_links_content(&decoded))
        }
        SubFormat::ClashYaml => parse_clash_yaml(content),
        SubFormat::Json => parse_json_nodes(content),
        SubFormat::Empty => anyhow::bail!("subscription content is empty"),
        SubFormat::Unknown => anyhow::bail!("unable to detect subscription format"),
    }
}

// ─── Base64 解码 ───

fn decode_base64_content(content: &str) -> Result<String> {
    let clean: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&clean)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(&clean))
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(&clean))?;
    Ok(String::from_utf8(bytes)?)
}

// ─── URI 列表 ───

fn parse_links_content(content: &str) -> Vec<Node> {
    let mut nodes = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(node) = parse_proxy_link(line) {
            nodes.push(node);
        }
    }
    nodes
}

/// 解析单个代理链接，失败返回 None
pub fn parse_proxy_link(link: &str) -> Option<Node> {
    let link = link.trim();
    if let Some(rest) = link.strip_prefix("vless://") {
        parse_vless_link(rest)
    } else if let Some(rest) = link.strip_prefix("vmess://") {
        parse_vmess_link(rest)
    } else if let Some(rest) = link.strip_prefix("trojan://") {
        parse_trojan_link(rest)
    } else {
        debug!(link, "unsupported proxy link scheme");
        None
    }
}

// ─── VLESS ───

fn parse_vless_link(rest: &str) -> Option<Node> {
    // uuid@host:port?params#name
    let (main, fragment) = rest.rsplit_once('#').unwrap_or((rest, ""));
    let (uuid, host_params) = main.split_once('@')?;
    let (host_port, params_str) = host_params.split_once('?').unwrap_or((host_params, ""));
    let (server, port_str) = parse_host_port(host_port)?;
    let port: u16 = port_str.parse().ok().filter(|p| *p > 0)?;

    let params = parse_query_params(params_str);
    let name = if fragment.is_empty() {
        format!("VLESS-{}:{}", server, port)
    } else {
        url_decode(fragment)
    };

    let mut node = Node::empty(name, "vless".to_string(), server, port);
    node.uuid = Some(uuid.to_string());
    node.tls = Some(TlsField::Name(
        params.get("security").cloned().unwrap_or_else(|| "none".to_string()),
    ));
    node.network = Some(params.get("type").cloned().unwrap_or_else(|| "tcp".to_string()));
    node.host = params.get("host").cloned();
    node.path = params.get("path").cloned();
    node.sni = params.get("sni").cloned();
    Some(node)
}

// ─── VMess ───

fn parse_vmess_link(encoded: &str) -> Option<Node> {
    // Payload is base64(JSON); tolerate junk around the object.
    let clean: String = encoded
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '-' | '_'))
        .collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&clean)
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(&clean))
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(&clean))
        .ok()?;
    let text = String::from_utf8_lossy(&bytes);
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    let v: serde_json::Value = serde_json::from_str(&text[start..=end]).ok()?;

    let server = v["add"].as_str().unwrap_or("").trim().to_string();
    if server.is_empty() {
        return None;
    }
    let port = json_number(&v["port"]).filter(|p| (1..=65535).contains(p))? as u16;
    let alter_id = json_number(&v["aid"]).unwrap_or(0) as u32;

    let name = v["ps"]
        .as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("VMess-{}:{}", server, port));

    let mut node = Node::empty(name, "vmess".to_string(), server, port);
    node.uuid = Some(v["id"].as_str().unwrap_or("").trim().to_string());
    node.alter_id = Some(alter_id);
    node.cipher = Some(v["scy"].as_str().unwrap_or("auto").trim().to_string());
    node.network = Some(v["net"].as_str().unwrap_or("tcp").trim().to_string());
    node.tls = Some(TlsField::Name(v["tls"].as_str().unwrap_or("").trim().to_string()));
    node.host = v["host"].as_str().map(|s| s.trim().to_string());
    node.path = v["path"].as_str().map(|s| s.trim().to_string());
    Some(node)
}

/// 数字或数字字符串（"443"、"443.0" 都出现过）
fn json_number(v: &serde_json::Value) -> Option<u64> {
    v.as_u64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok().map(|f| f as u64)))
}

// ─── Trojan ───

fn parse_trojan_link(rest: &str) -> Option<Node> {
    // password@host:port?params#name
    let (main, fragment) = rest.rsplit_once('#').unwrap_or((rest, ""));
    let (password, host_params) = main.split_once('@')?;
    let (host_port, params_str) = host_params.split_once('?').unwrap_or((host_params, ""));
    let (server, port_str) = parse_host_port(host_port)?;
    let port: u16 = port_str.parse().ok().filter(|p| *p > 0)?;

    let params = parse_query_params(params_str);
    let name = if fragment.is_empty() {
        format!("Trojan-{}:{}", server, port)
    } else {
        url_decode(fragment)
    };

    let mut node = Node::empty(name, "trojan".to_string(), server.clone(), port);
    node.password = Some(url_decode(password));
    node.sni = Some(params.get("sni").cloned().unwrap_or(server));
    node.skip_cert_verify =
        Some(params.get("allowInsecure").map(|v| v == "true" || v == "1").unwrap_or(false));
    Some(node)
}

// ─── Clash YAML ───

fn parse_clash_yaml(content: &str) -> Result<Vec<Node>> {
    let yaml: serde_yml::Value = serde_yml::from_str(content)?;
    let proxies = yaml["proxies"]
        .as_sequence()
        .ok_or_else(|| anyhow::anyhow!("clash YAML: missing proxies array"))?;

    let mut nodes = Vec::new();
    for proxy in proxies {
        if let Some(node) = parse_clash_proxy(proxy) {
            nodes.push(node);
        }
    }
    Ok(nodes)
}

fn parse_clash_proxy(v: &serde_yml::Value) -> Option<Node> {
    let name = v["name"].as_str()?.to_string();
    let node_type = v["type"].as_str()?.to_string();
    let server = v["server"].as_str()?.to_string();
    let port = v["port"].as_u64().filter(|p| (1..=65535).contains(p))? as u16;

    let mut node = Node::empty(name, node_type, server, port);
    node.uuid = v["uuid"].as_str().map(String::from);
    node.password = v["password"].as_str().map(String::from);
    node.cipher = v["cipher"].as_str().map(String::from);
    node.network = v["network"].as_str().map(String::from);
    node.sni = v["sni"].as_str().or(v["servername"].as_str()).map(String::from);
    node.alter_id = v["alterId"].as_u64().map(|a| a as u32);
    node.host = v["host"].as_str().map(String::from);
    node.path = v["path"].as_str().map(String::from);
    node.skip_cert_verify = v["skip-cert-verify"].as_bool();
    node.tls = match &v["tls"] {
        serde_yml::Value::Bool(b) => Some(TlsField::Flag(*b)),
        serde_yml::Value::String(s) => Some(TlsField::Name(s.clone())),
        _ => None,
    };
    Some(node)
}

// ─── JSON 数组 ───

fn parse_json_nodes(content: &str) -> Result<Vec<Node>> {
    let nodes: Vec<Node> = serde_json::from_str(content)?;
    Ok(nodes)
}

// ─── 辅助函数 ───

fn parse_host_port(s: &str) -> Option<(String, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, port_with_bracket) = rest.split_once(']')?;
        let port_str = port_with_bracket.strip_prefix(':')?;
        Some((host.to_string(), port_str))
    } else {
        let (host, port) = s.rsplit_once(':')?;
        Some((host.to_string(), port))
    }
}

/// Simple percent-decoding; malformed escapes are kept verbatim.
fn url_decode(s: &str) -> String {
    if !s.contains('%') && !s.contains('+') {
        return s.to_string();
    }
    fn hex_val(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let mut result = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        result.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        result.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                result.push(b' ');
                i += 1;
            }
            b => {
                result.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&result).into_owned()
}

fn parse_query_params(s: &str) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();
    if s.is_empty() {
        return map;
    }
    for pair in s.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            map.insert(url_decode(k), url_decode(v));
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_vless_link_basic() {
        let link =
            "vless://uuid-1234@server.com:443?security=tls&sni=server.com&type=ws&path=%2Fws#MyNode";
        let node = parse_proxy_link(link).unwrap();
        assert_eq!(node.name, "MyNode");
        assert_eq!(node.node_type, "vless");
        assert_eq!(node.uuid.as_deref(), Some("uuid-1234"));
        assert_eq!(node.server, "server.com");
        assert_eq!(node.port, 443);
        assert_eq!(node.network.as_deref(), Some("ws"));
        assert_eq!(node.path.as_deref(), Some("/ws"));
        assert!(node.tls_enabled());
    }

    #[test]
    fn parse_vless_link_defaults() {
        let node = parse_proxy_link("vless://u@s.com:8443").unwrap();
        assert_eq!(node.name, "VLESS-s.com:8443");
        assert_eq!(node.network.as_deref(), Some("tcp"));
        assert!(!node.tls_enabled());
    }

    #[test]
    fn parse_vmess_link_basic() {
        let vmess_json = serde_json::json!({
            "v": "2", "ps": "TestVMess", "add": "server.com",
            "port": 443, "id": "test-uuid", "aid": 0,
            "scy": "auto", "net": "ws", "tls": "tls",
            "host": "cdn.com", "path": "/ray"
        });
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(vmess_json.to_string());
        let node = parse_proxy_link(&format!("vmess://{}", encoded)).unwrap();
        assert_eq!(node.name, "TestVMess");
        assert_eq!(node.uuid.as_deref(), Some("test-uuid"));
        assert_eq!(node.alter_id, Some(0));
        assert_eq!(node.network.as_deref(), Some("ws"));
        assert_eq!(node.host.as_deref(), Some("cdn.com"));
        assert!(node.tls_enabled());
    }

    #[test]
    fn parse_vmess_link_string_port_and_aid() {
        let vmess_json = serde_json::json!({
            "ps": "N", "add": "s.com", "port": "443.0", "id": "u", "aid": "2"
        });
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(vmess_json.to_string());
        let node = parse_proxy_link(&format!("vmess://{}", encoded)).unwrap();
        assert_eq!(node.port, 443);
        assert_eq!(node.alter_id, Some(2));
    }

    #[test]
    fn parse_vmess_link_rejects_bad_port() {
        let vmess_json = serde_json::json!({"add": "s.com", "port": 0, "id": "u"});
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(vmess_json.to_string());
        assert!(parse_proxy_link(&format!("vmess://{}", encoded)).is_none());
    }

    #[test]
    fn parse_vmess_link_rejects_empty_server() {
        let vmess_json = serde_json::json!({"add": "", "port": 443, "id": "u"});
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(vmess_json.to_string());
        assert!(parse_proxy_link(&format!("vmess://{}", encoded)).is_none());
    }

    #[test]
    fn parse_trojan_link_basic() {
        let link = "trojan://pass%40word@server.com:443?sni=sni.com&allowInsecure=true#My%20Trojan";
        let node = parse_proxy_link(link).unwrap();
        assert_eq!(node.name, "My Trojan");
        assert_eq!(node.password.as_deref(), Some("pass@word"));
        assert_eq!(node.sni.as_deref(), Some("sni.com"));
        assert_eq!(node.skip_cert_verify, Some(true));
    }

    #[test]
    fn trojan_sni_defaults_to_server() {
        let node = parse_proxy_link("trojan://pw@server.com:443").unwrap();
        assert_eq!(node.sni.as_deref(), Some("server.com"));
        assert_eq!(node.skip_cert_verify, Some(false));
    }

    #[test]
    fn unsupported_scheme_is_skipped() {
        assert!(parse_proxy_link("ss://abcdef@x.com:1#n").is_none());
    }

    #[test]
    fn parse_links_skips_comments_and_garbage() {
        let content = "# comment\n\nvless://u@a.com:443#A\nnot a link\ntrojan://p@b.com:443#B\n";
        let nodes = parse_subscription(content).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "A");
        assert_eq!(nodes[1].name, "B");
    }

    #[test]
    fn parse_base64_wrapped_list() {
        let content = "vless://u@a.com:443#A\ntrojan://p@b.com:443#B";
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        assert_eq!(detect_format(&encoded), SubFormat::Base64);
        let nodes = parse_subscription(&encoded).unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn parse_clash_yaml_basic() {
        let yaml = r#"
proxies:
  - name: "node1"
    type: vless
    server: server.com
    port: 443
    uuid: "u1"
    tls: true
  - name: "node2"
    type: trojan
    server: t.com
    port: 8443
    password: "pw"
    sni: "t.com"
    skip-cert-verify: true
  - name: "node3"
    type: vmess
    server: v.com
    port: 80
    uuid: "u3"
    alterId: 4
"#;
        let nodes = parse_subscription(yaml).unwrap();
        assert_eq!(nodes.len(), 3);
        assert!(nodes[0].tls_enabled());
        assert_eq!(nodes[1].skip_cert_verify, Some(true));
        assert_eq!(nodes[2].alter_id, Some(4));
    }

    #[test]
    fn parse_json_array_of_nodes() {
        let json = r#"[
            {"name": "a", "type": "vless", "server": "s.com", "port": 443, "uuid": "u"},
            {"name": "b", "type": "trojan", "server": "t.com", "port": 443, "password": "p"}
        ]"#;
        let nodes = parse_subscription(json).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].password.as_deref(), Some("p"));
    }

    #[test]
    fn detect_format_cases() {
        assert_eq!(detect_format(""), SubFormat::Empty);
        assert_eq!(detect_format("proxies:\n  - name: x"), SubFormat::ClashYaml);
        assert_eq!(detect_format("[{\"name\": \"x\"}]"), SubFormat::Json);
        assert_eq!(detect_format("vless://u@a.com:443"), SubFormat::Links);
        assert_eq!(detect_format("!!!???"), SubFormat::Unknown);
    }

    #[test]
    fn parse_host_port_forms() {
        assert_eq!(
            parse_host_port("1.2.3.4:443").unwrap(),
            ("1.2.3.4".to_string(), "443")
        );
        assert_eq!(
            parse_host_port("[::1]:443").unwrap(),
            ("::1".to_string(), "443")
        );
        assert!(parse_host_port("noport").is_none());
    }

    #[test]
    fn url_decode_basics() {
        assert_eq!(url_decode("a%2Fb+c"), "a/b c");
        assert_eq!(url_decode("plain"), "plain");
        assert_eq!(url_decode("bad%zz"), "bad%zz");
    }
}
