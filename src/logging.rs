/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Default event-logging handlers.
//!
//! The replicator logs through the [log](https://docs.rs/log/latest/log/) crate; set up
//! a logging implementation to get these messages onto a terminal or into a file.
//!
//! ## Log message format
//!
//! Event log lines are CSVs with at least two values: the event name in PascalCase and
//! the time the event was emitted (seconds since the Unix epoch). Remaining values
//! depend on the event; member ids appear as the first seven characters of their
//! base64 encoding.

use std::time::SystemTime;

use crate::events::*;

pub const VIEW_DELIVERED: &str = "ViewDelivered";
pub const CERTIFY: &str = "Certify";
pub const CERTIFY_FAILED: &str = "CertifyFailed";
pub const COMMIT_CUT: &str = "CommitCut";
pub const STATE_TRANSFER_BEGIN: &str = "StateTransferBegin";
pub const STATE_TRANSFER_END: &str = "StateTransferEnd";
pub const FLOW_CONTROL: &str = "FlowControl";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ViewDeliveredEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ViewDeliveredEvent| {
            log::info!(
                "{}, {}, {}, {:?}, {}",
                VIEW_DELIVERED,
                secs_since_unix_epoch(event.timestamp),
                event.view.id,
                event.view.kind,
                event.view.members.len()
            )
        })
    }
}

impl Logger for CertifyEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CertifyEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                CERTIFY,
                secs_since_unix_epoch(event.timestamp),
                event.seqno,
                event.source,
                event.trx_id,
                event.local
            )
        })
    }
}

impl Logger for CertifyFailedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CertifyFailedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                CERTIFY_FAILED,
                secs_since_unix_epoch(event.timestamp),
                event.seqno,
                event.source,
                event.trx_id,
                event.local
            )
        })
    }
}

impl Logger for CommitCutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CommitCutEvent| {
            log::info!(
                "{}, {}, {}",
                COMMIT_CUT,
                secs_since_unix_epoch(event.timestamp),
                event.last_committed
            )
        })
    }
}

impl Logger for StateTransferBeginEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StateTransferBeginEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                STATE_TRANSFER_BEGIN,
                secs_since_unix_epoch(event.timestamp),
                event.joiner,
                event
                    .donor
                    .map(|donor| donor.tag())
                    .unwrap_or_else(|| "none".to_string()),
                event.full_snapshot
            )
        })
    }
}

impl Logger for StateTransferEndEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StateTransferEndEvent| {
            log::info!(
                "{}, {}, {}",
                STATE_TRANSFER_END,
                secs_since_unix_epoch(event.timestamp),
                event.member
            )
        })
    }
}

impl Logger for FlowControlEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &FlowControlEvent| {
            log::info!(
                "{}, {}, {}, {}",
                FLOW_CONTROL,
                secs_since_unix_epoch(event.timestamp),
                event.pause,
                event.backlog
            )
        })
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("event occurred before the Unix epoch")
        .as_secs()
}
