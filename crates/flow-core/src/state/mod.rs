//! Execution state machine transitions.
//!
//! Validates and executes state transitions for executions, enforcing the
//! allowed transition graph and optimistic locking.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use flow_db::models::ExecutionStatus;
use flow_db::queries::executions as db;

/// The execution state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending -> running
/// pending -> cancelled
/// running -> completed
/// running -> failed
/// running -> timed_out
/// running -> cancelled
/// ```
///
/// Every other status is terminal: no outgoing edges.
pub struct ExecutionStateMachine;

impl ExecutionStateMachine {
    pub fn is_valid_transition(from: ExecutionStatus, to: ExecutionStatus) -> bool {
        matches!(
            (from, to),
            (ExecutionStatus::Pending, ExecutionStatus::Running)
                | (ExecutionStatus::Pending, ExecutionStatus::Cancelled)
                | (ExecutionStatus::Running, ExecutionStatus::Completed)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
                | (ExecutionStatus::Running, ExecutionStatus::TimedOut)
                | (ExecutionStatus::Running, ExecutionStatus::Cancelled)
        )
    }

    /// `pending -> running`. Fails loudly (invalid attempts are never
    /// silently dropped) if the transition is not legal or the version
    /// does not match.
    pub async fn start(pool: &PgPool, id: Uuid, expected_version: i64) -> Result<()> {
        let rows = db::start_execution(pool, id, expected_version)
            .await
            .with_context(|| format!("failed to start execution {id}"))?;
        Self::check_rows(pool, id, rows, ExecutionStatus::Pending, ExecutionStatus::Running).await
    }

    /// `running -> completed`.
    pub async fn complete(
        pool: &PgPool,
        id: Uuid,
        expected_version: i64,
        output: Value,
    ) -> Result<()> {
        let rows = db::complete_execution(pool, id, expected_version, output)
            .await
            .with_context(|| format!("failed to complete execution {id}"))?;
        Self::check_rows(
            pool,
            id,
            rows,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
        )
        .await
    }

    /// `running -> failed`.
    pub async fn fail(pool: &PgPool, id: Uuid, expected_version: i64, error: &str) -> Result<()> {
        let rows = db::fail_execution(pool, id, expected_version, error)
            .await
            .with_context(|| format!("failed to fail execution {id}"))?;
        Self::check_rows(pool, id, rows, ExecutionStatus::Running, ExecutionStatus::Failed).await
    }

    /// `pending -> cancelled` or `running -> cancelled`.
    pub async fn cancel(pool: &PgPool, id: Uuid, expected_version: i64) -> Result<()> {
        let rows = db::cancel_execution(pool, id, expected_version)
            .await
            .with_context(|| format!("failed to cancel execution {id}"))?;
        if rows == 0 {
            let execution = db::get_execution(pool, id).await?;
            match execution {
                None => bail!("execution {id} not found"),
                Some(e) if matches!(e.status, ExecutionStatus::Pending | ExecutionStatus::Running) => {
                    bail!(
                        "optimistic lock failed: execution {id} has version {}, expected {}",
                        e.version,
                        expected_version
                    )
                }
                // Cancelling an already-terminal execution is a no-op, not
                // an error: the caller raced a completion and loses,
                // which is fine.
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// `running -> timed_out`, used only by the leader-gated timeout sweep.
    pub async fn timeout(pool: &PgPool, id: Uuid, expected_version: i64) -> Result<()> {
        let rows = db::timeout_execution(pool, id, expected_version)
            .await
            .with_context(|| format!("failed to time out execution {id}"))?;
        Self::check_rows(
            pool,
            id,
            rows,
            ExecutionStatus::Running,
            ExecutionStatus::TimedOut,
        )
        .await
    }

    async fn check_rows(
        pool: &PgPool,
        id: Uuid,
        rows: u64,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid state transition: {from} -> {to} for execution {id}");
        }
        if rows == 0 {
            let execution = db::get_execution(pool, id).await?;
            match execution {
                None => bail!("execution {id} not found"),
                Some(e) => bail!(
                    "optimistic lock failed: execution {id} has status {}, expected {from}",
                    e.status
                ),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions_from_pending() {
        assert!(ExecutionStateMachine::is_valid_transition(
            ExecutionStatus::Pending,
            ExecutionStatus::Running
        ));
        assert!(ExecutionStateMachine::is_valid_transition(
            ExecutionStatus::Pending,
            ExecutionStatus::Cancelled
        ));
        assert!(!ExecutionStateMachine::is_valid_transition(
            ExecutionStatus::Pending,
            ExecutionStatus::Completed
        ));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for terminal in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::TimedOut,
        ] {
            for to in [
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Completed,
                ExecutionStatus::Failed,
                ExecutionStatus::Cancelled,
                ExecutionStatus::TimedOut,
            ] {
                assert!(!ExecutionStateMachine::is_valid_transition(terminal, to));
            }
        }
    }

    #[test]
    fn running_can_reach_any_terminal_state() {
        for to in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::TimedOut,
        ] {
            assert!(ExecutionStateMachine::is_valid_transition(
                ExecutionStatus::Running,
                to
            ));
        }
    }
}
