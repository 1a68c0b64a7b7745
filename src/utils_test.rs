use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::models::NodeId;
use crate::utils;

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct Capacities {
    #[serde(with = "crate::utils::pairs")]
    nodes: BTreeMap<NodeId, u64>,
}

#[test]
fn encoded_sequence_numbers_preserve_order() -> Result<()> {
    let seqs = [0u64, 1, 255, 256, 65_536, u64::MAX - 1, u64::MAX];
    for pair in seqs.windows(2) {
        let (lhs, rhs) = (utils::encode_u64(pair[0]), utils::encode_u64(pair[1]));
        assert!(lhs < rhs, "expected encoding of {} to sort before encoding of {}", pair[0], pair[1]);
        assert_eq!(utils::decode_u64(&lhs)?, pair[0]);
    }
    Ok(())
}

#[test]
fn decode_u64_rejects_invalid_lengths() {
    assert!(utils::decode_u64(&[0u8; 7]).is_err(), "expected short buffer to be rejected");
    assert!(utils::decode_u64(&[0u8; 9]).is_err(), "expected long buffer to be rejected");
}

#[test]
fn maps_with_non_string_keys_encode_as_pairs() -> Result<()> {
    let mut model = Capacities::default();
    model.nodes.insert(NodeId(2), 20);
    model.nodes.insert(NodeId(1), 10);

    let encoded = utils::encode_model(&model)?;
    let value: serde_json::Value = serde_json::from_slice(&encoded)?;
    assert_eq!(value["nodes"], serde_json::json!([[1, 10], [2, 20]]), "expected ordered pairs");
    let decoded: Capacities = utils::decode_model(&encoded)?;
    assert_eq!(decoded, model);
    Ok(())
}
