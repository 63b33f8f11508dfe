/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the view manager and multicast engine threads and
//! passes them to event handlers.
//!
//! When the thread receives a message containing an [event](crate::events::Event), it triggers
//! the execution of all handlers defined for the contained event type, where the handlers for
//! each event type are stored in [`EventHandlers`].
//!
//! When no handlers are present in a group's instance of `EventHandlers` this thread is not
//! started.

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread,
    thread::JoinHandle,
};

use crate::{events::*, logging::Logger};

/// Pointer to a handler closure, parametrised by the argument (for our use case, event) type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Stores the two optional handlers enabled for an event type that implements the [`Logger`]
/// trait, namely one logging handler, defined in [`logging`](crate::logging), and one
/// user-defined handler, passed to the [group builder](crate::group::GroupSpec).
pub(crate) struct HandlerPair<T: Logger> {
    pub(crate) user_defined_handler: Option<HandlerPtr<T>>,
    pub(crate) logging_handler: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    // Checks if no event handlers are defined for this event.
    pub(crate) fn is_empty(&self) -> bool {
        self.user_defined_handler.is_none() && self.logging_handler.is_none()
    }

    /// Creates a new `HandlerPair` with the user-defined handler, and the default logging handler
    /// if logging is enabled.
    pub(crate) fn new(log: bool, user_defined_handler: Option<HandlerPtr<T>>) -> HandlerPair<T> {
        HandlerPair {
            user_defined_handler,
            logging_handler: if log { Some(T::get_logger()) } else { None },
        }
    }

    fn fire(&self, event: &T) {
        self.user_defined_handler
            .iter()
            .for_each(|handler| handler(event));
        self.logging_handler.iter().for_each(|handler| handler(event));
    }
}

/// Stores the `HandlerPair` of user-defined and optional logging handlers for each pre-defined
/// event type from [events](crate::events).
pub(crate) struct EventHandlers {
    pub(crate) view_installed_handlers: HandlerPair<ViewInstalledEvent>,
    pub(crate) suspect_handlers: HandlerPair<SuspectEvent>,
    pub(crate) propose_change_handlers: HandlerPair<ProposeChangeEvent>,
    pub(crate) commit_changes_handlers: HandlerPair<CommitChangesEvent>,
    pub(crate) wedge_handlers: HandlerPair<WedgeEvent>,
    pub(crate) global_min_ready_handlers: HandlerPair<GlobalMinReadyEvent>,
    pub(crate) deliver_handlers: HandlerPair<DeliverEvent>,
    pub(crate) receive_join_request_handlers: HandlerPair<ReceiveJoinRequestEvent>,
    pub(crate) send_state_transfer_handlers: HandlerPair<SendStateTransferEvent>,
}

impl EventHandlers {
    /// Creates the [handler pairs](HandlerPair) for all pre-defined event types given the
    /// user-defined handlers, and information on whether logging is enabled.
    pub(crate) fn new(
        log: bool,
        view_installed_handler: Option<HandlerPtr<ViewInstalledEvent>>,
        suspect_handler: Option<HandlerPtr<SuspectEvent>>,
        propose_change_handler: Option<HandlerPtr<ProposeChangeEvent>>,
        commit_changes_handler: Option<HandlerPtr<CommitChangesEvent>>,
        wedge_handler: Option<HandlerPtr<WedgeEvent>>,
        global_min_ready_handler: Option<HandlerPtr<GlobalMinReadyEvent>>,
        deliver_handler: Option<HandlerPtr<DeliverEvent>>,
        receive_join_request_handler: Option<HandlerPtr<ReceiveJoinRequestEvent>>,
        send_state_transfer_handler: Option<HandlerPtr<SendStateTransferEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            view_installed_handlers: HandlerPair::new(log, view_installed_handler),
            suspect_handlers: HandlerPair::new(log, suspect_handler),
            propose_change_handlers: HandlerPair::new(log, propose_change_handler),
            commit_changes_handlers: HandlerPair::new(log, commit_changes_handler),
            wedge_handlers: HandlerPair::new(log, wedge_handler),
            global_min_ready_handlers: HandlerPair::new(log, global_min_ready_handler),
            deliver_handlers: HandlerPair::new(log, deliver_handler),
            receive_join_request_handlers: HandlerPair::new(log, receive_join_request_handler),
            send_state_transfer_handlers: HandlerPair::new(log, send_state_transfer_handler),
        }
    }

    /// Checks if no handlers are defined, i.e., neither user-defined handlers were defined nor
    /// logging is enabled.
    pub(crate) fn is_empty(&self) -> bool {
        self.view_installed_handlers.is_empty()
            && self.suspect_handlers.is_empty()
            && self.propose_change_handlers.is_empty()
            && self.commit_changes_handlers.is_empty()
            && self.wedge_handlers.is_empty()
            && self.global_min_ready_handlers.is_empty()
            && self.deliver_handlers.is_empty()
            && self.receive_join_request_handlers.is_empty()
            && self.send_state_transfer_handlers.is_empty()
    }

    /// Triggers the execution of each of the two handlers - the user-defined and the logging
    /// handler, if defined - for a given event type from [events](crate::events).
    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ViewInstalled(event) => self.view_installed_handlers.fire(&event),
            Event::Suspect(event) => self.suspect_handlers.fire(&event),
            Event::ProposeChange(event) => self.propose_change_handlers.fire(&event),
            Event::CommitChanges(event) => self.commit_changes_handlers.fire(&event),
            Event::Wedge(event) => self.wedge_handlers.fire(&event),
            Event::GlobalMinReady(event) => self.global_min_ready_handlers.fire(&event),
            Event::Deliver(event) => self.deliver_handlers.fire(&event),
            Event::ReceiveJoinRequest(event) => self.receive_join_request_handlers.fire(&event),
            Event::SendStateTransfer(event) => self.send_state_transfer_handlers.fire(&event),
        }
    }
}

/// Starts the event bus thread, which runs an infinite loop until a shutdown signal is received
/// from the parent thread. In each iteration of the loop, the thread checks if it received any
/// event notifications, and if so, then triggers the execution of the handlers defined for the
/// event.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            Err(TryRecvError::Disconnected) => return,
        }
    })
}
