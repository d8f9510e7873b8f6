//! XML-RPC envelope codec.
//!
//! Encodes `methodCall` envelopes and decodes `methodResponse` payloads for
//! the subset of XML-RPC the backend speaks: nil, boolean, int/i4/i8,
//! double, string, dateTime.iso8601, base64, array and struct. Integers are
//! encoded as `<int>` only when they fit 32 bits; wider values fall back to
//! `<double>`, matching the protocol's integer width limit.

use std::fmt::Write as _;

use quick_xml::Reader;
use quick_xml::escape::{escape, unescape};
use quick_xml::events::Event;
use serde_json::{Map, Number, Value};

use super::{RpcError, RpcFault, RpcResult};

/// Encode a `methodCall` envelope.
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut xml = String::with_capacity(256);
    xml.push_str("<?xml version=\"1.0\"?><methodCall><methodName>");
    xml.push_str(&escape(method));
    xml.push_str("</methodName><params>");
    for param in params {
        xml.push_str("<param>");
        encode_value(&mut xml, param);
        xml.push_str("</param>");
    }
    xml.push_str("</params></methodCall>");
    xml
}

fn encode_value(out: &mut String, value: &Value) {
    out.push_str("<value>");
    match value {
        Value::Null => out.push_str("<nil/>"),
        Value::Bool(b) => {
            let _ = write!(out, "<boolean>{}</boolean>", if *b { 1 } else { 0 });
        }
        Value::Number(n) => encode_number(out, n),
        Value::String(s) => {
            let _ = write!(out, "<string>{}</string>", escape(s.as_str()));
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                encode_value(out, item);
            }
            out.push_str("</data></array>");
        }
        Value::Object(map) => {
            out.push_str("<struct>");
            for (key, val) in map {
                out.push_str("<member><name>");
                out.push_str(&escape(key.as_str()));
                out.push_str("</name>");
                encode_value(out, val);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

fn encode_number(out: &mut String, n: &Number) {
    if let Some(i) = n.as_i64() {
        if i >= i64::from(i32::MIN) && i <= i64::from(i32::MAX) {
            let _ = write!(out, "<int>{}</int>", i);
        } else {
            let _ = write!(out, "<double>{}</double>", i);
        }
    } else if let Some(f) = n.as_f64() {
        let _ = write!(out, "<double>{}</double>", f);
    } else {
        let _ = write!(out, "<string>{}</string>", n);
    }
}

/// Decode a `methodResponse` envelope into its single result value, or a
/// fault into [`RpcError::Fault`].
pub fn decode_response(xml: &str) -> RpcResult<Value> {
    let root = parse_tree(xml)?;
    if root.name != "methodResponse" {
        return Err(RpcError::Protocol(format!(
            "expected methodResponse, got <{}>",
            root.name
        )));
    }

    match root.children.first() {
        Some(node) if node.name == "params" => {
            let value = node
                .find("param")
                .and_then(|p| p.find("value"))
                .map(node_to_value)
                .unwrap_or(Value::Null);
            Ok(value)
        }
        Some(node) if node.name == "fault" => Err(RpcError::Fault(decode_fault(node))),
        _ => Err(RpcError::Protocol(
            "methodResponse carries neither params nor fault".to_string(),
        )),
    }
}

fn decode_fault(fault: &XmlNode) -> RpcFault {
    let detail = fault.find("value").map(node_to_value).unwrap_or_default();
    let fault_string = detail
        .get("faultString")
        .and_then(Value::as_str)
        .unwrap_or("unknown XML-RPC fault")
        .to_string();

    // Odoo packs the full server traceback into faultString.
    if fault_string.contains('\n') {
        let first_line = fault_string
            .lines()
            .next()
            .unwrap_or(&fault_string)
            .to_string();
        RpcFault::from_backend(first_line, Some(fault_string))
    } else {
        RpcFault::from_backend(fault_string, None)
    }
}

#[derive(Debug, Default)]
struct XmlNode {
    name: String,
    text: String,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn find(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }
}

fn parse_tree(xml: &str) -> RpcResult<XmlNode> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                stack.push(XmlNode {
                    name,
                    ..Default::default()
                });
            }
            Ok(Event::Empty(empty)) => {
                let name = String::from_utf8_lossy(empty.local_name().as_ref()).into_owned();
                let node = XmlNode {
                    name,
                    ..Default::default()
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Ok(Event::Text(text)) => {
                let raw = text
                    .decode()
                    .map_err(|e| RpcError::Protocol(format!("bad XML text: {e}")))?;
                let decoded = unescape(&raw)
                    .map_err(|e| RpcError::Protocol(format!("bad XML text: {e}")))?;
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&decoded);
                }
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| RpcError::Protocol("unbalanced XML".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(RpcError::Protocol(format!("malformed XML: {e}"))),
        }
    }

    root.ok_or_else(|| RpcError::Protocol("empty XML document".to_string()))
}

/// Convert a `<value>` node into JSON.
fn node_to_value(value_node: &XmlNode) -> Value {
    let Some(typed) = value_node.children.first() else {
        // Bare text inside <value> is a string per the XML-RPC spec.
        return Value::String(value_node.text.clone());
    };

    let text = typed.text.trim();
    match typed.name.as_str() {
        "nil" => Value::Null,
        "boolean" => Value::Bool(text == "1" || text.eq_ignore_ascii_case("true")),
        "int" | "i4" | "i8" => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        "double" => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        "string" | "dateTime.iso8601" | "base64" => Value::String(typed.text.clone()),
        "array" => {
            let items = typed
                .find("data")
                .map(|data| {
                    data.children
                        .iter()
                        .filter(|c| c.name == "value")
                        .map(node_to_value)
                        .collect()
                })
                .unwrap_or_default();
            Value::Array(items)
        }
        "struct" => {
            let mut map = Map::new();
            for member in typed.children.iter().filter(|c| c.name == "member") {
                let key = member
                    .find("name")
                    .map(|n| n.text.clone())
                    .unwrap_or_default();
                let val = member.find("value").map(node_to_value).unwrap_or_default();
                map.insert(key, val);
            }
            Value::Object(map)
        }
        _ => Value::String(typed.text.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_scalar_params() {
        let xml = encode_call("authenticate", &[json!("db"), json!("admin"), json!(2)]);
        assert!(xml.contains("<methodName>authenticate</methodName>"));
        assert!(xml.contains("<string>db</string>"));
        assert!(xml.contains("<int>2</int>"));
    }

    #[test]
    fn wide_integers_fall_back_to_double() {
        let xml = encode_call("m", &[json!(5_000_000_000_i64)]);
        assert!(xml.contains("<double>5000000000</double>"));
        assert!(!xml.contains("<int>"));
    }

    #[test]
    fn escapes_markup_in_strings() {
        let xml = encode_call("m", &[json!("<b>&amp;</b>")]);
        assert!(xml.contains("&lt;b&gt;"));
        assert!(!xml.contains("<b>&amp;</b>"));
    }

    #[test]
    fn decodes_scalar_response() {
        let xml = "<?xml version=\"1.0\"?><methodResponse><params><param><value><int>7</int></value></param></params></methodResponse>";
        assert_eq!(decode_response(xml).unwrap(), json!(7));
    }

    #[test]
    fn decodes_struct_and_array() {
        let xml = concat!(
            "<methodResponse><params><param><value><array><data>",
            "<value><struct>",
            "<member><name>id</name><value><int>1</int></value></member>",
            "<member><name>name</name><value><string>Acme</string></value></member>",
            "<member><name>active</name><value><boolean>1</boolean></value></member>",
            "</struct></value>",
            "</data></array></value></param></params></methodResponse>",
        );
        let value = decode_response(xml).unwrap();
        assert_eq!(value, json!([{"id": 1, "name": "Acme", "active": true}]));
    }

    #[test]
    fn bare_value_text_is_string() {
        let xml = "<methodResponse><params><param><value>plain</value></param></params></methodResponse>";
        assert_eq!(decode_response(xml).unwrap(), json!("plain"));
    }

    #[test]
    fn nil_decodes_to_null() {
        let xml =
            "<methodResponse><params><param><value><nil/></value></param></params></methodResponse>";
        assert_eq!(decode_response(xml).unwrap(), Value::Null);
    }

    #[test]
    fn fault_becomes_rpc_fault() {
        let xml = concat!(
            "<methodResponse><fault><value><struct>",
            "<member><name>faultCode</name><value><int>1</int></value></member>",
            "<member><name>faultString</name><value><string>Traceback (most recent call last):\n",
            "  ...\nodoo.exceptions.AccessError: not allowed</string></value></member>",
            "</struct></value></fault></methodResponse>",
        );
        match decode_response(xml) {
            Err(RpcError::Fault(fault)) => {
                assert_eq!(
                    fault.error_class.as_deref(),
                    Some("odoo.exceptions.AccessError")
                );
                assert_eq!(fault.message, "not allowed");
            }
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn round_trips_nested_payload() {
        let payload = json!({"domain": [["name", "=", "acme"]], "limit": 10, "flag": true});
        let xml = format!(
            "<methodResponse><params><param>{}</param></params></methodResponse>",
            {
                let mut s = String::new();
                encode_value(&mut s, &payload);
                s
            }
        );
        assert_eq!(decode_response(&xml).unwrap(), payload);
    }
}
