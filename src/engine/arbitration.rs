//! Arbitration bookkeeping and the pure decision rule applied to an
//! arbitrator's verdict.
//!
//! When a monitor-side lease expires and the pre-arbitration ping goes
//! unanswered, the agent hands the dispute to an arbitration-enabled local
//! application. The application answers through `complete_arbitration` with
//! a TTL pair whose values encode the verdict; the rule below maps that pair
//! onto relationship transitions. It is deterministic so both disputing
//! agents, fed the same verdict, reach complementary outcomes.

use crate::protocol::{LeaseRelationshipId, TTL_MAX};

use tokio::time::{Duration, Instant};

/// Outcome of applying an arbitration verdict on the local side.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum ArbitrationOutcome {
    /// Local side lost; its own lease must fail.
    LocalFails,

    /// Local side survives and must tell the remote it failed, once the
    /// remote's granted TTL has lapsed.
    LocalSurvives { terminate_remote_after: Duration },

    /// Local side survives; the remote was granted an unbounded TTL and must
    /// never be sent a termination for this dispute.
    LocalSurvivesRemoteUnkillable,

    /// Verdict was inconclusive. Neither side acts; the remote agent is held
    /// alive for a grace period instead of being reaped or re-arbitrated
    /// immediately.
    Neutral,
}

/// Maps a `(local_ttl, remote_ttl)` verdict onto the local outcome.
///
/// `local_ttl == 0` means the local side lost. `local_ttl == TTL_MAX` means
/// it survives; the remote TTL then bounds how long to wait before declaring
/// the remote failed (`TTL_MAX` there marks the remote unkillable, as in a
/// one-way dispute). Any other local TTL is treated as inconclusive.
pub(crate) fn decide_arbitration(
    local_ttl_ms: i64,
    remote_ttl_ms: i64,
) -> ArbitrationOutcome {
    if local_ttl_ms == 0 {
        ArbitrationOutcome::LocalFails
    } else if local_ttl_ms == TTL_MAX {
        if remote_ttl_ms == TTL_MAX {
            ArbitrationOutcome::LocalSurvivesRemoteUnkillable
        } else {
            ArbitrationOutcome::LocalSurvives {
                terminate_remote_after: Duration::from_millis(
                    remote_ttl_ms.max(0) as u64,
                ),
            }
        }
    } else {
        ArbitrationOutcome::Neutral
    }
}

/// One in-flight arbitration for a lease relationship.
#[derive(Debug)]
pub(crate) struct PendingArbitration {
    pub(crate) rel_id: LeaseRelationshipId,

    /// Name of the application the request was dispatched to.
    pub(crate) arbitrator_app: String,

    /// When the request went out; the fail-closed deadline is measured from
    /// here.
    pub(crate) started_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_mapping() {
        assert_eq!(decide_arbitration(0, 0), ArbitrationOutcome::LocalFails);
        assert_eq!(
            decide_arbitration(0, TTL_MAX),
            ArbitrationOutcome::LocalFails
        );
        assert_eq!(
            decide_arbitration(TTL_MAX, 4500),
            ArbitrationOutcome::LocalSurvives {
                terminate_remote_after: Duration::from_millis(4500)
            }
        );
        assert_eq!(
            decide_arbitration(TTL_MAX, 0),
            ArbitrationOutcome::LocalSurvives {
                terminate_remote_after: Duration::ZERO
            }
        );
        assert_eq!(
            decide_arbitration(TTL_MAX, TTL_MAX),
            ArbitrationOutcome::LocalSurvivesRemoteUnkillable
        );
        assert_eq!(decide_arbitration(1234, 1234), ArbitrationOutcome::Neutral);
    }

    #[test]
    fn complementary_verdicts() {
        // the two disputing sides see mirrored TTL pairs; exactly one fails
        let local = decide_arbitration(TTL_MAX, 3000);
        let remote = decide_arbitration(0, TTL_MAX);
        assert!(matches!(local, ArbitrationOutcome::LocalSurvives { .. }));
        assert_eq!(remote, ArbitrationOutcome::LocalFails);
    }
}
