use std::sync::Arc;

use tracing::warn;

use acquira_core::error::GatewayError;
use acquira_core::records::RetryTask;
use acquira_core::types::now_ts;
use acquira_store::GatewayDb;

/// Dead-letter queue: terminal parking for transactions whose retries were
/// exhausted or were blocked by an OPEN circuit. Keyed by transaction id, so
/// a task lands here exactly once.
pub struct DeadLetterQueue {
    db: Arc<GatewayDb>,
}

impl DeadLetterQueue {
    pub fn new(db: Arc<GatewayDb>) -> Self {
        Self { db }
    }

    pub fn park(
        &self,
        transaction_id: &str,
        psp_name: &str,
        payload: Vec<u8>,
        attempt_count: u32,
        last_error: &str,
    ) -> Result<(), GatewayError> {
        let task = RetryTask {
            transaction_id: transaction_id.to_string(),
            psp_name: psp_name.to_string(),
            payload,
            attempt_count,
            last_error: last_error.to_string(),
            created_at: now_ts(),
        };
        warn!(
            transaction_id,
            psp = psp_name,
            attempts = attempt_count,
            error = last_error,
            "transaction dead-lettered"
        );
        self.db.push_dead_letter(&task)
    }

    pub fn get(&self, transaction_id: &str) -> Result<Option<RetryTask>, GatewayError> {
        self.db.get_dead_letter(transaction_id)
    }

    pub fn list(&self, limit: usize) -> Result<Vec<RetryTask>, GatewayError> {
        self.db.dead_letters(limit)
    }

    pub fn len(&self) -> u64 {
        self.db.count_dead_letters()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_task_appears_exactly_once() {
        let db = Arc::new(GatewayDb::open_temporary().unwrap());
        let dlq = DeadLetterQueue::new(db);

        dlq.park("pay_1", "stripe", b"payload".to_vec(), 3, "processor timeout").unwrap();
        // A duplicate park for the same transaction overwrites, not appends.
        dlq.park("pay_1", "stripe", b"payload".to_vec(), 3, "processor timeout").unwrap();

        assert_eq!(dlq.len(), 1);
        let task = dlq.get("pay_1").unwrap().unwrap();
        assert_eq!(task.attempt_count, 3);
        assert_eq!(task.last_error, "processor timeout");
    }
}
