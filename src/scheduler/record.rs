use std::collections::VecDeque;
use std::time::Duration;
use std::time::SystemTime;

use super::ResyncType;
use super::TxnOperation;
use super::ValueState;
use crate::constants::TXN_TYPE_NB;
use crate::constants::TXN_TYPE_RETRY;
use crate::constants::TXN_TYPE_SB;
use crate::SchedulerConfig;
use crate::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnType {
    NbTransaction,
    SbNotification,
    /// Retry of the values that failed in an earlier transaction
    RetryFailedOps,
}

impl TxnType {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            TxnType::NbTransaction => TXN_TYPE_NB,
            TxnType::SbNotification => TXN_TYPE_SB,
            TxnType::RetryFailedOps => TXN_TYPE_RETRY,
        }
    }
}

/// One executed (or attempted) southbound operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedTxnOp {
    pub operation: TxnOperation,
    pub key: String,
    pub derived: bool,
    pub prev_value: Option<Value>,
    pub new_value: Option<Value>,
    pub prev_state: ValueState,
    pub new_state: ValueState,
    pub error: Option<String>,
    pub is_retry: bool,
    /// Part of a delete-then-add replacing a modify
    pub is_recreate: bool,
}

#[derive(Debug, Clone)]
pub struct RecordedTxn {
    pub seq_num: u64,
    pub txn_type: TxnType,
    pub resync_type: ResyncType,
    pub description: Option<String>,
    pub start: SystemTime,
    pub stop: SystemTime,
    /// Values as submitted; `None` is a delete
    pub values: Vec<(String, Option<Value>)>,
    pub executed: Vec<RecordedTxnOp>,
}

/// Bounded history of processed transactions.
///
/// Records older than the age limit are trimmed, except those started
/// within the init period after the engine was created.
pub(crate) struct TxnHistory {
    enabled: bool,
    records: VecDeque<RecordedTxn>,
    created: SystemTime,
    age_limit: Duration,
    init_period: Duration,
}

impl TxnHistory {
    pub(crate) fn new(
        config: &SchedulerConfig,
        created: SystemTime,
    ) -> Self {
        Self {
            enabled: config.record_transaction_history,
            records: VecDeque::new(),
            created,
            age_limit: config.history_age_limit(),
            init_period: config.permanent_init_period(),
        }
    }

    pub(crate) fn record(
        &mut self,
        txn: RecordedTxn,
    ) {
        if !self.enabled {
            return;
        }
        let now = txn.stop;
        self.records.push_back(txn);
        self.trim(now);
    }

    pub(crate) fn trim(
        &mut self,
        now: SystemTime,
    ) {
        let permanent_until = self.created + self.init_period;
        let age_limit = self.age_limit;
        self.records.retain(|r| {
            r.start < permanent_until
                || now.duration_since(r.stop).map_or(true, |age| age <= age_limit)
        });
    }

    /// Records whose start falls within `[since, until]`.
    pub(crate) fn range(
        &self,
        since: Option<SystemTime>,
        until: Option<SystemTime>,
    ) -> Vec<RecordedTxn> {
        self.records
            .iter()
            .filter(|r| since.map_or(true, |s| r.start >= s))
            .filter(|r| until.map_or(true, |u| r.start <= u))
            .cloned()
            .collect()
    }

    pub(crate) fn get(
        &self,
        seq_num: u64,
    ) -> Option<RecordedTxn> {
        self.records.iter().find(|r| r.seq_num == seq_num).cloned()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}
