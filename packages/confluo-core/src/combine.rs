use chrono::Utc;
use serde_json::{json, Value};

use crate::record::Record;

/// A pure function that combines two records observed from two different
/// sources into one. Implementations never see or mutate block/part
/// bookkeeping (join counts, eviction times) — that belongs to the caller
/// (the block store), which keeps strategies trivially unit-testable.
pub trait Combine: Send + Sync {
    fn combine(
        &self,
        src_a: &str,
        part_a: &Record,
        src_b: &str,
        part_b: &Record,
        key_defs: &[String],
    ) -> anyhow::Result<Record>;
}

/// Side-by-side join: key fields are copied once, every other field from
/// both sides is included, and on a non-key field-name collision the value
/// from `part_b` (the later-arriving side) wins.
pub struct Join;

impl Combine for Join {
    fn combine(
        &self,
        _src_a: &str,
        part_a: &Record,
        _src_b: &str,
        part_b: &Record,
        key_defs: &[String],
    ) -> anyhow::Result<Record> {
        let mut out = Record::new();

        for key in key_defs {
            if let Some(v) = part_a.get(key).or_else(|| part_b.get(key)) {
                out.insert(key.clone(), v.clone());
            }
        }

        for (k, v) in part_a {
            if key_defs.iter().any(|key| key == k) {
                continue;
            }
            out.insert(k.clone(), v.clone());
        }

        // part_b wins on collision: inserted last, after part_a's fields.
        for (k, v) in part_b {
            if key_defs.iter().any(|key| key == k) {
                continue;
            }
            out.insert(k.clone(), v.clone());
        }

        out.insert("joinedAt".to_string(), json!(Utc::now().to_rfc3339()));
        Ok(out)
    }
}

/// Union merge: every field from both sides is included; a field present on
/// both sides with differing values becomes a two-element array `[a, b]`.
pub struct Merge;

impl Combine for Merge {
    fn combine(
        &self,
        _src_a: &str,
        part_a: &Record,
        _src_b: &str,
        part_b: &Record,
        _key_defs: &[String],
    ) -> anyhow::Result<Record> {
        let mut out = Record::new();

        for (k, v) in part_a {
            out.insert(k.clone(), v.clone());
        }

        for (k, v) in part_b {
            match out.get(k) {
                None => {
                    out.insert(k.clone(), v.clone());
                }
                Some(existing) if existing == v => {}
                Some(existing) => {
                    out.insert(k.clone(), Value::Array(vec![existing.clone(), v.clone()]));
                }
            }
        }

        out.insert("mergedAt".to_string(), json!(Utc::now().to_rfc3339()));
        Ok(out)
    }
}
