//! Conflict strategy: how a late operation is rebased over earlier ones.
//!
//! The engine only ever asks one question: "`applied` already happened,
//! `incoming` was authored against the same document, what should
//! `incoming` become?" Strategies answer it. The default is the pairwise
//! Quill transform with the applied side winning insert ties; it keeps
//! intent for simple cases but is not a convergent OT or CRDT scheme.

use tracing::debug;

use crate::delta::Delta;

pub trait ConflictStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rewrite `incoming` so it applies after `applied`.
    fn transform(&self, applied: &Delta, incoming: &Delta) -> Delta;
}

/// Pairwise Quill transform. Earlier inserts at the same position stay first.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestEffortTransform;

impl ConflictStrategy for BestEffortTransform {
    fn name(&self) -> &'static str {
        "best_effort_transform"
    }

    fn transform(&self, applied: &Delta, incoming: &Delta) -> Delta {
        applied.transform(incoming, true)
    }
}

/// Rebase `incoming` over each of `applied` in order.
pub fn rebase<'a>(strategy: &dyn ConflictStrategy, applied: impl IntoIterator<Item = &'a Delta>, incoming: &Delta) -> Delta {
    applied
        .into_iter()
        .fold(incoming.clone(), |op, earlier| strategy.transform(earlier, &op))
}

/// Make a batch of concurrent operations applicable in order.
///
/// Every op in `ops` was authored against the same document. Op `k` is
/// rebased over the already-resolved ops `0..k`, so applying the output
/// left to right is well defined.
pub fn resolve_batch(strategy: &dyn ConflictStrategy, ops: &[Delta]) -> Vec<Delta> {
    let mut resolved: Vec<Delta> = Vec::with_capacity(ops.len());
    for op in ops {
        let rebased = rebase(strategy, resolved.iter(), op);
        resolved.push(rebased);
    }
    debug!(strategy = strategy.name(), count = resolved.len(), "conflict: resolved batch");
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> Delta {
        Delta::new().insert(text)
    }

    fn apply_all(base: &Delta, ops: &[Delta]) -> Delta {
        ops.iter()
            .fold(base.clone(), |content, op| op.apply_to(&content).unwrap())
    }

    #[test]
    fn concurrent_inserts_at_same_position_keep_earlier_first() {
        let base = doc("ac");
        let ops = vec![Delta::new().retain(1).insert("X"), Delta::new().retain(1).insert("Y")];
        let resolved = resolve_batch(&BestEffortTransform, &ops);
        assert_eq!(resolved[0], ops[0]);
        assert_eq!(apply_all(&base, &resolved).to_plain_text(), "aXYc");
    }

    #[test]
    fn insert_shifts_later_delete() {
        let base = doc("hello world");
        let ops = vec![Delta::new().insert(">> "), Delta::new().retain(6).delete(5)];
        let resolved = resolve_batch(&BestEffortTransform, &ops);
        assert_eq!(apply_all(&base, &resolved).to_plain_text(), ">> hello ");
    }

    #[test]
    fn overlapping_deletes_do_not_double_delete() {
        let base = doc("abcdef");
        let ops = vec![Delta::new().retain(1).delete(3), Delta::new().retain(2).delete(3)];
        let resolved = resolve_batch(&BestEffortTransform, &ops);
        assert_eq!(apply_all(&base, &resolved).to_plain_text(), "af");
    }

    #[test]
    fn rebase_over_nothing_is_identity() {
        let op = Delta::new().retain(2).insert("z");
        assert_eq!(rebase(&BestEffortTransform, std::iter::empty(), &op), op);
    }

    #[test]
    fn three_way_batch_applies_cleanly() {
        let base = doc("0123456789");
        let ops = vec![
            Delta::new().retain(2).insert("A"),
            Delta::new().retain(5).delete(2),
            Delta::new().retain(9).insert("B"),
        ];
        let resolved = resolve_batch(&BestEffortTransform, &ops);
        assert_eq!(apply_all(&base, &resolved).to_plain_text(), "01A23478B9");
    }
}
