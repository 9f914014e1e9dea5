//! Apply pipeline: a single-owner loop that walks `last_applied` up to
//! `commit_index` and hands each committed command to the applicator, in log
//! order, outside the consensus lock.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::RaftNode;

/// External collaborator that interprets committed commands. Implementations
/// must tolerate re-delivery after a restart (the commit cursor is volatile).
#[async_trait]
pub trait Applicator: Send + Sync {
    async fn apply(&self, command: &Value) -> anyhow::Result<()>;
}

pub(crate) async fn run(node: RaftNode) {
    let applicator = node.applicator.clone();
    let mut shutdown = node.shutdown_tx.subscribe();
    loop {
        loop {
            let next = {
                let mut st = node.state.lock().await;
                if st.last_applied >= st.commit_index {
                    None
                } else if applicator.is_none() {
                    // Nothing to invoke; just keep the cursor current.
                    st.last_applied = st.commit_index;
                    None
                } else {
                    st.last_applied += 1;
                    Some(st.log[st.last_applied as usize].command.clone())
                }
            };
            let (Some(command), Some(applicator)) = (next, applicator.as_ref()) else {
                break;
            };
            // Applicator failures do not roll the cursor back; the log is
            // authoritative and the index stays applied.
            if let Err(err) = applicator.apply(&command).await {
                warn!(%err, "applicator rejected committed command");
            }
        }
        tokio::select! {
            _ = node.apply_notify.notified() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
