//! Property tests for envelope parsing and attempt headers.

use proptest::prelude::*;
use relay_core::{
    envelope::{HTTP_REQUEST_FIELD, URL_SUFFIX_FIELD},
    models::parse_attempt,
    Envelope,
};
use serde_json::{Map, Value};

fn payload_strategy() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z]{1,12}", any::<i64>(), 0..8).prop_map(|fields| {
        fields.into_iter().map(|(key, value)| (key, Value::from(value))).collect()
    })
}

proptest! {
    #[test]
    fn attempt_is_always_positive(raw in any::<Option<String>>()) {
        prop_assert!(parse_attempt(raw.as_deref()) >= 1);
    }

    #[test]
    fn positive_attempts_are_read_back(attempt in 1u32..u32::MAX) {
        prop_assert_eq!(parse_attempt(Some(&attempt.to_string())), attempt);
    }

    /// Unrecognized fields pass through untouched and routing fields never do.
    #[test]
    fn routing_fields_are_stripped(payload in payload_strategy(), suffix in "/[a-z0-9/]{0,20}") {
        let mut body = payload.clone();
        body.insert(HTTP_REQUEST_FIELD.to_string(), Value::from("PUT"));
        body.insert(URL_SUFFIX_FIELD.to_string(), Value::from(suffix.clone()));
        let raw = serde_json::to_vec(&Value::Object(body)).unwrap();

        let envelope = Envelope::parse(&raw).unwrap();

        prop_assert_eq!(envelope.url_suffix.as_deref(), Some(suffix.as_str()));
        prop_assert_eq!(envelope.http_method.as_deref(), Some("PUT"));
        prop_assert_eq!(envelope.payload, payload);
    }
}
