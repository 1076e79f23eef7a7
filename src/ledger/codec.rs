//! Capdata codec for values published to, and actions sent to, the ledger.
//!
//! Two body encodings are in circulation:
//! - legacy JSON, where bigints are `{"@qclass":"bigint","digits":"N"}` and
//!   remotables are `{"@qclass":"slot","index":i}`
//! - smallcaps, a `#`-prefixed body where bigints are `"+N"`/`"-N"`,
//!   remotables are `"$i.iface"` and strings that would be ambiguous carry a
//!   leading `!`
//!
//! Both are revived into a plain `serde_json::Value`: bigints become numbers
//! (or digit strings when they exceed 64 bits) and slot references become the
//! slot's board id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Marshalled value as stored on the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData {
    pub body: String,
    #[serde(default)]
    pub slots: Vec<String>,
}

/// One vstorage stream cell: every value written at `block_height`
#[derive(Debug, Clone, PartialEq)]
pub struct StreamCell {
    pub block_height: u64,
    pub values: Vec<String>,
}

/// Parse the decoded `abci_query` payload `{"value": "<cell json>"}`
pub fn decode_stream_cell(text: &str) -> Result<StreamCell, String> {
    let outer: Value = serde_json::from_str(text).map_err(|e| format!("outer json: {}", e))?;
    let inner_text = outer
        .get("value")
        .and_then(Value::as_str)
        .ok_or("missing value field")?;
    let inner: Value =
        serde_json::from_str(inner_text).map_err(|e| format!("stream cell json: {}", e))?;

    let block_height = inner
        .get("blockHeight")
        .and_then(as_u64)
        .ok_or("missing blockHeight")?;
    let values = inner
        .get("values")
        .and_then(Value::as_array)
        .ok_or("missing values")?
        .iter()
        .map(|v| v.as_str().map(str::to_owned).ok_or("non-string cell value"))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StreamCell {
        block_height,
        values,
    })
}

/// Decode one capdata string into a plain value
pub fn decode_capdata(raw: &str) -> Result<Value, String> {
    let capdata: CapData = serde_json::from_str(raw).map_err(|e| format!("capdata: {}", e))?;

    if let Some(smallcaps) = capdata.body.strip_prefix('#') {
        let encoded: Value =
            serde_json::from_str(smallcaps).map_err(|e| format!("smallcaps body: {}", e))?;
        return Ok(revive_smallcaps(encoded, &capdata.slots));
    }

    // Some publishers double-escape the legacy body
    let encoded: Value = serde_json::from_str(&capdata.body)
        .or_else(|_| serde_json::from_str(&capdata.body.replace('\\', "")))
        .map_err(|e| format!("legacy body: {}", e))?;
    Ok(revive_legacy(encoded, &capdata.slots))
}

fn revive_smallcaps(value: Value, slots: &[String]) -> Value {
    match value {
        Value::String(s) => revive_smallcaps_str(s, slots),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| revive_smallcaps(v, slots))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, revive_smallcaps(v, slots)))
                .collect(),
        ),
        other => other,
    }
}

fn revive_smallcaps_str(s: String, slots: &[String]) -> Value {
    let Some(first) = s.chars().next() else {
        return Value::String(s);
    };
    match first {
        '!' => Value::String(s[1..].to_string()),
        '+' | '-' => bigint_value(&s[1..], first == '-').unwrap_or(Value::String(s)),
        '$' | '&' => slot_ref(&s[1..], slots).unwrap_or(Value::String(s)),
        '#' => Value::Null,
        '%' => Value::String(s[1..].to_string()),
        _ => Value::String(s),
    }
}

/// `"0.Alleged: BLD brand"` -> slots[0]
fn slot_ref(rest: &str, slots: &[String]) -> Option<Value> {
    let index: usize = rest.split('.').next()?.parse().ok()?;
    slots.get(index).cloned().map(Value::String)
}

fn revive_legacy(value: Value, slots: &[String]) -> Value {
    match value {
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| revive_legacy(v, slots)).collect())
        }
        Value::Object(map) => match map.get("@qclass").and_then(Value::as_str) {
            Some("bigint") => map
                .get("digits")
                .and_then(Value::as_str)
                .and_then(|d| {
                    let negative = d.starts_with('-');
                    bigint_value(d.trim_start_matches('-'), negative)
                })
                .unwrap_or(Value::Null),
            Some("slot") => map
                .get("index")
                .and_then(Value::as_u64)
                .and_then(|i| slots.get(i as usize))
                .cloned()
                .map(Value::String)
                .unwrap_or(Value::Null),
            Some(_) => Value::Null,
            None => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, revive_legacy(v, slots)))
                    .collect(),
            ),
        },
        other => other,
    }
}

fn bigint_value(digits: &str, negative: bool) -> Option<Value> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if negative {
        let n: i64 = format!("-{}", digits).parse().ok()?;
        return Some(Value::Number(Number::from(n)));
    }
    match digits.parse::<u64>() {
        Ok(n) => Some(Value::Number(Number::from(n))),
        Err(_) => Some(Value::String(digits.to_string())),
    }
}

/// Integer view of a revived value: numbers and digit strings
pub fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim_start_matches('+').parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
pub fn as_i128(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) => n.as_i64().map(i128::from).or_else(|| n.as_u64().map(i128::from)),
        Value::String(s) => s.trim_start_matches('+').parse().ok(),
        _ => None,
    }
}

/// Passable data the bridge sends to the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum Passable {
    Str(String),
    Num(u64),
    BigInt(i128),
    Record(Vec<(String, Passable)>),
    List(Vec<Passable>),
}

impl Passable {
    pub fn record<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Passable)>,
        K: Into<String>,
    {
        Passable::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn str(s: impl Into<String>) -> Self {
        Passable::Str(s.into())
    }

    fn to_smallcaps(&self) -> Value {
        match self {
            Passable::Str(s) => Value::String(escape_smallcaps_str(s)),
            Passable::Num(n) => Value::Number(Number::from(*n)),
            Passable::BigInt(n) if *n < 0 => Value::String(n.to_string()),
            Passable::BigInt(n) => Value::String(format!("+{}", n)),
            Passable::Record(fields) => {
                let mut map = Map::new();
                for (k, v) in fields {
                    map.insert(k.clone(), v.to_smallcaps());
                }
                Value::Object(map)
            }
            Passable::List(items) => Value::Array(items.iter().map(Passable::to_smallcaps).collect()),
        }
    }

    /// Marshal as smallcaps capdata with no slots
    pub fn marshal(&self) -> CapData {
        CapData {
            body: format!("#{}", self.to_smallcaps()),
            slots: Vec::new(),
        }
    }
}

fn escape_smallcaps_str(s: &str) -> String {
    match s.chars().next() {
        Some(c) if "!\"#$%&'()*+,-".contains(c) => format!("!{}", s),
        _ => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legacy_bigint_price() {
        let body = json!({
            "amountIn": {"brand": {"@qclass": "slot", "index": 0}, "value": {"@qclass": "bigint", "digits": "1000000"}},
            "amountOut": {"brand": {"@qclass": "slot", "index": 1}, "value": {"@qclass": "bigint", "digits": "9870000"}}
        })
        .to_string();
        let raw = json!({"body": body, "slots": ["board0223", "board0074"]}).to_string();

        let v = decode_capdata(&raw).unwrap();
        assert_eq!(as_u64(&v["amountIn"]["value"]), Some(1_000_000));
        assert_eq!(as_u64(&v["amountOut"]["value"]), Some(9_870_000));
        assert_eq!(v["amountOut"]["brand"], json!("board0074"));
    }

    #[test]
    fn test_smallcaps_round() {
        let body = r##"#{"roundId":"+42","startedAt":"+1700000000","startedBy":"agoric1oracle"}"##;
        let raw = json!({"body": body, "slots": []}).to_string();

        let v = decode_capdata(&raw).unwrap();
        assert_eq!(as_u64(&v["roundId"]), Some(42));
        assert_eq!(v["startedBy"], json!("agoric1oracle"));
    }

    #[test]
    fn test_smallcaps_escapes_and_remotables() {
        let body = r##"#{"note":"!+not-a-number","brand":"$0.Alleged: IST brand","missing":"#undefined"}"##;
        let raw = json!({"body": body, "slots": ["board0257"]}).to_string();

        let v = decode_capdata(&raw).unwrap();
        assert_eq!(v["note"], json!("+not-a-number"));
        assert_eq!(v["brand"], json!("board0257"));
        assert_eq!(v["missing"], Value::Null);
    }

    #[test]
    fn test_stream_cell() {
        let inner = json!({"blockHeight": "1234", "values": ["a", "b"]}).to_string();
        let text = json!({ "value": inner }).to_string();

        let cell = decode_stream_cell(&text).unwrap();
        assert_eq!(cell.block_height, 1234);
        assert_eq!(cell.values, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_marshal_escapes_and_bigints() {
        let action = Passable::record([
            ("method", Passable::str("executeOffer")),
            ("tag", Passable::str("#weird")),
            ("price", Passable::BigInt(987654)),
            ("round", Passable::Num(3)),
        ]);
        let capdata = action.marshal();
        assert!(capdata.body.starts_with('#'));
        assert!(capdata.slots.is_empty());

        let body: Value = serde_json::from_str(&capdata.body[1..]).unwrap();
        assert_eq!(body["method"], json!("executeOffer"));
        assert_eq!(body["tag"], json!("!#weird"));
        assert_eq!(body["price"], json!("+987654"));
        assert_eq!(body["round"], json!(3));
    }

    #[test]
    fn test_marshalled_action_decodes_back() {
        let action = Passable::record([("price", Passable::BigInt(5)), ("who", Passable::str("agoric1x"))]);
        let raw = serde_json::to_string(&action.marshal()).unwrap();
        let v = decode_capdata(&raw).unwrap();
        assert_eq!(as_u64(&v["price"]), Some(5));
        assert_eq!(v["who"], json!("agoric1x"));
    }
}
