//! 引擎配置生成
//!
//! 把节点描述映射为外部引擎的 JSON 配置文档。纯函数，同样的输入产生
//! 字节相同的输出，是引擎 schema 兼容性的唯一出处。

use serde_json::{json, Value};

use crate::common::Error;
use crate::subscription::Node;

const DNS_SERVERS: [&str; 3] = ["223.5.5.5", "119.29.29.29", "8.8.8.8"];

/// 空闲 worker 的占位配置：SOCKS5 入站 + 直连出站
pub fn build_idle_config(local_port: u16) -> Value {
    json!({
        "log": {"loglevel": "error"},
        "inbounds": [socks_inbound(local_port)],
        "outbounds": [{"protocol": "freedom"}]
    })
}

/// 为节点生成完整引擎配置
pub fn build_engine_config(node: &Node, local_port: u16) -> Result<Value, Error> {
    let outbound = match node.node_type.as_str() {
        "vless" => vless_outbound(node),
        "vmess" => vmess_outbound(node),
        "trojan" => trojan_outbound(node),
        other => return Err(Error::UnsupportedProtocol(other.to_string())),
    };

    Ok(json!({
        "log": {"loglevel": "error"},
        "inbounds": [socks_inbound(local_port)],
        "outbounds": [outbound, {"protocol": "freedom", "tag": "direct"}],
        "dns": {"servers": DNS_SERVERS},
        "routing": {
            "rules": [
                {"type": "field", "ip": ["geoip:private"], "outboundTag": "direct"}
            ]
        }
    }))
}

fn socks_inbound(local_port: u16) -> Value {
    json!({
        "listen": "127.0.0.1",
        "port": local_port,
        "protocol": "socks",
        "settings": {"auth": "noauth", "udp": true}
    })
}

fn vless_outbound(node: &Node) -> Value {
    let network = node.network.as_deref().unwrap_or("tcp");
    let mut stream = json!({"network": network});

    if node.tls_enabled() {
        stream["security"] = json!("tls");
        stream["tlsSettings"] = json!({
            "serverName": node.sni.as_deref().filter(|s| !s.is_empty()).unwrap_or(&node.server),
            "allowInsecure": true
        });
    }

    if network == "ws" {
        let mut ws = json!({"path": node.path.as_deref().unwrap_or("/")});
        if let Some(host) = node.host.as_deref().filter(|h| !h.is_empty()) {
            ws["headers"] = json!({"Host": host});
        }
        stream["wsSettings"] = ws;
    }

    json!({
        "protocol": "vless",
        "settings": {
            "vnext": [{
                "address": node.server,
                "port": node.port,
                "users": [{
                    "id": node.uuid.as_deref().unwrap_or(""),
                    "encryption": "none"
                }]
            }]
        },
        "streamSettings": stream
    })
}

fn vmess_outbound(node: &Node) -> Value {
    let mut stream = json!({"network": node.network.as_deref().unwrap_or("tcp")});

    if node.tls_enabled() {
        stream["security"] = json!("tls");
        stream["tlsSettings"] = json!({
            "serverName": node.host.as_deref().filter(|h| !h.is_empty()).unwrap_or(&node.server),
            "allowInsecure": true
        });
    }

    json!({
        "protocol": "vmess",
        "settings": {
            "vnext": [{
                "address": node.server,
                "port": node.port,
                "users": [{
                    "id": node.uuid.as_deref().unwrap_or(""),
                    "alterId": node.alter_id.unwrap_or(0),
                    "security": node.cipher.as_deref().unwrap_or("auto")
                }]
            }]
        },
        "streamSettings": stream
    })
}

fn trojan_outbound(node: &Node) -> Value {
    json!({
        "protocol": "trojan",
        "settings": {
            "servers": [{
                "address": node.server,
                "port": node.port,
                "password": node.password.as_deref().unwrap_or("")
            }]
        },
        "streamSettings": {
            "security": "tls",
            "tlsSettings": {
                "serverName": node.sni.as_deref().filter(|s| !s.is_empty()).unwrap_or(&node.server),
                "allowInsecure": node.skip_cert_verify.unwrap_or(true)
            }
        }
    })
}
