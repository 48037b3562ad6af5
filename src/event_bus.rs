/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the certifier thread and passes them to event
//! handlers.
//!
//! When the thread receives an [event](crate::events::Event), it triggers the handlers
//! registered for the contained event type: the user-defined handler passed to the
//! replicator builder, and the default logging handler from [`crate::logging`] when
//! logging is enabled. When no handlers at all are defined, the thread is not started.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

/// Pointer to a handler closure, parametrised by the event type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// The two optional handlers enabled for an event type: one user-defined, one logging.
pub(crate) struct HandlerPair<T: Logger> {
    pub(crate) user_defined_handler: Option<HandlerPtr<T>>,
    pub(crate) logging_handler: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    pub(crate) fn new(log: bool, user_defined_handler: Option<HandlerPtr<T>>) -> HandlerPair<T> {
        HandlerPair {
            user_defined_handler,
            logging_handler: if log { Some(T::get_logger()) } else { None },
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.user_defined_handler.is_none() && self.logging_handler.is_none()
    }

    fn fire(&self, event: &T) {
        if let Some(handler) = &self.user_defined_handler {
            handler(event);
        }
        if let Some(handler) = &self.logging_handler {
            handler(event);
        }
    }
}

/// Handlers for every pre-defined event type.
pub(crate) struct EventHandlers {
    pub(crate) view_delivered_handlers: HandlerPair<ViewDeliveredEvent>,
    pub(crate) certify_handlers: HandlerPair<CertifyEvent>,
    pub(crate) certify_failed_handlers: HandlerPair<CertifyFailedEvent>,
    pub(crate) commit_cut_handlers: HandlerPair<CommitCutEvent>,
    pub(crate) state_transfer_begin_handlers: HandlerPair<StateTransferBeginEvent>,
    pub(crate) state_transfer_end_handlers: HandlerPair<StateTransferEndEvent>,
    pub(crate) flow_control_handlers: HandlerPair<FlowControlEvent>,
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log: bool,
        view_delivered_handler: Option<HandlerPtr<ViewDeliveredEvent>>,
        certify_handler: Option<HandlerPtr<CertifyEvent>>,
        certify_failed_handler: Option<HandlerPtr<CertifyFailedEvent>>,
        commit_cut_handler: Option<HandlerPtr<CommitCutEvent>>,
        state_transfer_begin_handler: Option<HandlerPtr<StateTransferBeginEvent>>,
        state_transfer_end_handler: Option<HandlerPtr<StateTransferEndEvent>>,
        flow_control_handler: Option<HandlerPtr<FlowControlEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            view_delivered_handlers: HandlerPair::new(log, view_delivered_handler),
            certify_handlers: HandlerPair::new(log, certify_handler),
            certify_failed_handlers: HandlerPair::new(log, certify_failed_handler),
            commit_cut_handlers: HandlerPair::new(log, commit_cut_handler),
            state_transfer_begin_handlers: HandlerPair::new(log, state_transfer_begin_handler),
            state_transfer_end_handlers: HandlerPair::new(log, state_transfer_end_handler),
            flow_control_handlers: HandlerPair::new(log, flow_control_handler),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.view_delivered_handlers.is_empty()
            && self.certify_handlers.is_empty()
            && self.certify_failed_handlers.is_empty()
            && self.commit_cut_handlers.is_empty()
            && self.state_transfer_begin_handlers.is_empty()
            && self.state_transfer_end_handlers.is_empty()
            && self.flow_control_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ViewDelivered(event) => self.view_delivered_handlers.fire(&event),
            Event::Certify(event) => self.certify_handlers.fire(&event),
            Event::CertifyFailed(event) => self.certify_failed_handlers.fire(&event),
            Event::CommitCut(event) => self.commit_cut_handlers.fire(&event),
            Event::StateTransferBegin(event) => self.state_transfer_begin_handlers.fire(&event),
            Event::StateTransferEnd(event) => self.state_transfer_end_handlers.fire(&event),
            Event::FlowControl(event) => self.flow_control_handlers.fire(&event),
        }
    }
}

/// Start the event bus thread. Runs until the publisher side hangs up or a shutdown
/// signal arrives.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        if shutdown_signal.try_recv().is_ok() {
            return;
        }
        match event_subscriber.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
