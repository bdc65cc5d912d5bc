use rust_fsm::*;

use crate::reminders::model::Reminder;

state_machine! {
    notification_flow(PendingFirstNotify)

    PendingFirstNotify(HydrateNotifiedOnce) => NotifiedOnce,
    PendingFirstNotify(HydrateConstantActive) => NotifiedConstantActive,
    PendingFirstNotify(HydrateStopped) => Stopped,

    PendingFirstNotify(Notify) => NotifiedOnce,
    PendingFirstNotify(NotifyConstant) => NotifiedConstantActive,
    PendingFirstNotify(Stop) => Stopped,

    NotifiedConstantActive(NotifyConstant) => NotifiedConstantActive,
    NotifiedConstantActive(Stop) => Stopped
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationState {
    PendingFirstNotify,
    NotifiedOnce,
    NotifiedConstantActive,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationEvent {
    Notify,
    NotifyConstant,
    Stop,
}

impl NotificationState {
    pub fn of(reminder: &Reminder) -> Self {
        if reminder.constant_notify {
            if reminder.notify_stopped {
                NotificationState::Stopped
            } else if reminder.notified {
                NotificationState::NotifiedConstantActive
            } else {
                NotificationState::PendingFirstNotify
            }
        } else if reminder.notified {
            NotificationState::NotifiedOnce
        } else {
            NotificationState::PendingFirstNotify
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NotificationState::NotifiedOnce | NotificationState::Stopped
        )
    }

    pub fn accepts_dispatch(self) -> bool {
        matches!(
            self,
            NotificationState::PendingFirstNotify | NotificationState::NotifiedConstantActive
        )
    }
}

impl NotificationEvent {
    pub fn dispatch_for(reminder: &Reminder) -> Self {
        if reminder.constant_notify {
            NotificationEvent::NotifyConstant
        } else {
            NotificationEvent::Notify
        }
    }
}

fn hydrate(
    machine: &mut notification_flow::StateMachine,
    state: NotificationState,
) -> Result<(), ()> {
    let input = match state {
        NotificationState::PendingFirstNotify => return Ok(()),
        NotificationState::NotifiedOnce => notification_flow::Input::HydrateNotifiedOnce,
        NotificationState::NotifiedConstantActive => {
            notification_flow::Input::HydrateConstantActive
        }
        NotificationState::Stopped => notification_flow::Input::HydrateStopped,
    };
    machine.consume(&input).map_err(|_| ())?;
    Ok(())
}

pub fn transition(
    current: NotificationState,
    event: NotificationEvent,
) -> Option<NotificationState> {
    let mut machine = notification_flow::StateMachine::new();
    hydrate(&mut machine, current).ok()?;

    let input = match event {
        NotificationEvent::Notify => notification_flow::Input::Notify,
        NotificationEvent::NotifyConstant => notification_flow::Input::NotifyConstant,
        NotificationEvent::Stop => notification_flow::Input::Stop,
    };
    machine.consume(&input).ok()?;

    Some(match machine.state() {
        notification_flow::State::PendingFirstNotify => NotificationState::PendingFirstNotify,
        notification_flow::State::NotifiedOnce => NotificationState::NotifiedOnce,
        notification_flow::State::NotifiedConstantActive => {
            NotificationState::NotifiedConstantActive
        }
        notification_flow::State::Stopped => NotificationState::Stopped,
    })
}
