//! Property-based tests for the Rill runtime codecs.
//!
//! Uses proptest to generate random tables and envelopes and verify that
//! decoding inverts encoding.

use proptest::prelude::*;
use rill_runtime::table::{effect_id_hash, signature_hash, EffectTable, EffectTableEntry};
use rill_runtime::wire::{decode_args, encode_args, EffectEnvelope, WireValue, MAX_WIRE_ARGS};
use rill_runtime::ResumeKind;

fn wire_value() -> impl Strategy<Value = WireValue> {
    prop_oneof![
        Just(WireValue::None),
        any::<i32>().prop_map(WireValue::I32),
        any::<i64>().prop_map(WireValue::I64),
        any::<u32>().prop_map(|b| WireValue::F32(f32::from_bits(b & 0x7f7f_ffff))),
        any::<u64>().prop_map(|b| WireValue::F64(f64::from_bits(b & 0x7fef_ffff_ffff_ffff))),
    ]
}

fn entry() -> impl Strategy<Value = EffectTableEntry> {
    ("[A-Z][a-z]{0,8}", "[a-z]{1,8}", 0u32..8, any::<bool>()).prop_map(|(effect, op, op_id, tail)| {
        EffectTableEntry {
            effect_id: effect_id_hash(&effect),
            signature_hash: signature_hash(&format!("{effect}.{op}")),
            label: format!("{effect}.{op}"),
            effect_name: effect,
            op_id,
            resume_kind: if tail { ResumeKind::Tail } else { ResumeKind::Resume },
        }
    })
}

proptest! {
    /// Table decoding yields the encoded entries in order.
    #[test]
    fn table_roundtrip(entries in proptest::collection::vec(entry(), 0..24)) {
        let table: EffectTable = entries.iter().cloned().collect();
        let decoded = EffectTable::decode(&table.encode()).unwrap();
        prop_assert_eq!(decoded.entries(), entries.as_slice());
    }

    /// Argument envelopes survive a roundtrip through a minimum-size buffer.
    #[test]
    fn args_roundtrip(args in proptest::collection::vec(wire_value(), 0..=MAX_WIRE_ARGS)) {
        let mut buf = vec![0u8; 4096];
        encode_args(&mut buf, &args).unwrap();
        prop_assert_eq!(decode_args(&buf).unwrap(), args);
    }

    /// Effect envelopes carry their header fields unchanged.
    #[test]
    fn effect_envelope_roundtrip(
        op_index in 0u32..64,
        op_id in 0u32..16,
        effect_id in any::<u64>(),
        handle in any::<u32>(),
        args in proptest::collection::vec(wire_value(), 0..4),
    ) {
        let envelope = EffectEnvelope { op_index, op_id, effect_id, resume_kind: 1, handle, args };
        let mut buf = vec![0u8; 256];
        let written = envelope.encode(&mut buf).unwrap();
        prop_assert_eq!(written, envelope.encoded_len());
        prop_assert_eq!(EffectEnvelope::decode(&buf).unwrap(), envelope);
    }
}
