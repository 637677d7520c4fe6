use proptest::prelude::*;
use serde_json::{Map, Value};
use tinylink_communication::WireCodec;

/// Half a unit in the last encoded decimal, plus float noise
const TOLERANCE: f64 = 6e-6;

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1_000_000_000i64..1_000_000_000).prop_map(Value::from),
        (-1.0e6..1.0e6f64).prop_map(Value::from),
        "\\PC{0,12}".prop_map(Value::String),
    ]
}

fn key() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => "[a-z][a-z0-9_]{0,6}",
        1 => "\\PC{0,6}",
    ]
}

fn value() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map(key(), inner, 0..6)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

fn object() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(key(), value(), 1..6)
        .prop_map(|map| Value::Object(map.into_iter().collect::<Map<_, _>>()))
}

/// Equal up to number rounding
fn close(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() <= TOLERANCE,
            _ => false,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| close(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(key, x)| ys.get(key).is_some_and(|y| close(x, y)))
        }
        _ => a == b,
    }
}

proptest! {
    #[test]
    fn decode_inverts_encode(value in value()) {
        let codec = WireCodec::default();
        let decoded = codec.decode(&codec.encode(&value)).unwrap();
        prop_assert!(close(&value, &decoded), "{} decoded as {}", value, decoded);
    }

    #[test]
    fn abbreviated_literals_decode_the_same(value in value()) {
        let codec = WireCodec::default();
        let short = codec.with_abbreviated_literals(true).encode(&value);
        let decoded = codec.decode(&short).unwrap();
        prop_assert!(close(&value, &decoded), "{} decoded as {}", short, decoded);
    }

    #[test]
    fn truncated_objects_are_rejected(value in object(), cut in any::<prop::sample::Index>()) {
        let text = WireCodec::default().encode(&value);
        let boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        let end = boundaries[cut.index(boundaries.len())];
        prop_assert!(WireCodec::default().decode(&text[..end]).is_err(), "accepted {:?}", &text[..end]);
    }

    #[test]
    fn encoded_numbers_respect_precision(n in -1.0e6..1.0e6f64, precision in 0usize..8) {
        let codec = WireCodec::new(precision);
        let text = codec.format_number(n);
        let decimals = text.split('.').nth(1).map_or(0, str::len);
        prop_assert!(decimals <= precision);
        let parsed: f64 = text.parse().unwrap();
        prop_assert!((parsed - n).abs() <= 0.5 * 10f64.powi(-(precision as i32)) + 1e-9);
    }
}

#[test]
fn malformed_lines_are_rejected() {
    let codec = WireCodec::default();
    for text in [
        "",
        "{",
        "{a:1,}",
        "{a 1}",
        "{a:1}}",
        "{1:2}",
        r#"{"a":tru}"#,
        r#"{"a":"\q"}"#,
        r#"{"a":"\u12"}"#,
        r#"{"a":"\u00é9"}"#,
        "{a:-}",
        "{a:1.}",
        "[1,2",
    ] {
        assert!(codec.decode(text).is_err(), "accepted {:?}", text);
    }
}
