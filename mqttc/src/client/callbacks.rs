//! Application callbacks and their invocation guard.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{error, warn};

use crate::builder::ConnectBuilder;
use crate::error::{Error, Result};
use crate::protocol::{AuthPacket, ConnAck, DisconnectReasonCode, SubscribeReasonCode, UnsubAckReason};
use crate::types::{ApplicationMessage, ClientState};

/// Receives application messages.
pub type MessageCallback = Box<dyn FnMut(&ApplicationMessage) -> Result<()> + Send>;

/// Receives the SUBACK reason code of one topic filter.
pub type SubscribeAckCallback = Box<dyn FnMut(&str, SubscribeReasonCode) -> Result<()> + Send>;

/// Receives the UNSUBACK reason code of one topic filter.
pub type UnsubscribeAckCallback = Box<dyn FnMut(&str, UnsubAckReason) -> Result<()> + Send>;

/// Adjusts the connect builder right before CONNECT is sent.
pub type ConnectCustomizer = Box<dyn FnMut(&mut ConnectBuilder) + Send>;

type ConnectedCallback = Box<dyn FnMut() -> Result<()> + Send>;
type ConnAckCallback = Box<dyn FnMut(&ConnAck) -> Result<()> + Send>;
type AuthCallback = Box<dyn FnMut(&AuthPacket) -> Result<()> + Send>;
type ErrorCallback = Box<dyn FnMut(&Error) -> Result<()> + Send>;
type DisconnectCallback = Box<dyn FnMut(DisconnectReasonCode, &str) -> Result<()> + Send>;
type StateChangedCallback = Box<dyn FnMut(ClientState, ClientState) -> Result<()> + Send>;

/// Client-wide callbacks. All of them run on the thread calling
/// [`Client::tick`](super::Client::tick).
#[derive(Default)]
pub(crate) struct Callbacks {
    pub on_connected: Option<ConnectedCallback>,
    pub on_connack: Option<ConnAckCallback>,
    pub on_message: Option<MessageCallback>,
    pub on_auth: Option<AuthCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_disconnect: Option<DisconnectCallback>,
    pub on_state_changed: Option<StateChangedCallback>,
    pub customize_connect: Option<ConnectCustomizer>,
}

/// Run a callback, containing its failures.
///
/// A panic or an ordinary error is logged and swallowed. An
/// [`Error::Mqtt`] is handed back so the caller can tear the connection
/// down with the matching reason code.
pub(crate) fn guard(name: &str, f: impl FnOnce() -> Result<()>) -> Result<()> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e @ Error::Mqtt { .. })) => {
            warn!("{} callback reported a protocol error: {}", name, e);
            Err(e)
        }
        Ok(Err(e)) => {
            error!("{} callback failed: {}", name, e);
            Ok(())
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("{} callback panicked: {}", name, message);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MqttErrorKind;

    #[test]
    fn test_guard_contains_failures() {
        assert!(guard("ok", || Ok(())).is_ok());
        assert!(guard("plain", || Err(Error::Callback("boom".into()))).is_ok());
        assert!(guard("panic", || panic!("boom")).is_ok());

        let err = guard("mqtt", || Err(Error::mqtt(MqttErrorKind::ProtocolError, "bad"))).unwrap_err();
        assert_eq!(err.mqtt_kind(), Some(MqttErrorKind::ProtocolError));
    }
}
