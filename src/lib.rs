//! # botlink
//!
//! Request/response protocol layer for controlling small robots over
//! Bluetooth Low Energy.
//!
//! A robot exposes one GATT characteristic for commands and one for
//! notifications. Replies arrive on the notification stream in no particular
//! order, mixed with unsolicited sensor events. botlink frames commands,
//! serializes writes, correlates replies with the requests waiting for them
//! and tears everything down cleanly when the link drops.
//!
//! ```no_run
//! use botlink::{with_connection, Command, ConnectionConfig, Transport};
//! use std::sync::Arc;
//!
//! async fn robot_name(transport: Arc<dyn Transport>) -> Result<Vec<u8>, botlink::ClientError> {
//!     with_connection(transport, ConnectionConfig::default(), |conn| async move {
//!         let reply = conn.send(Command::new(0x01, Vec::<u8>::new())).await?;
//!         Ok(reply.map(|r| r.payload().to_vec()).unwrap_or_default())
//!     })
//!     .await
//! }
//! ```

pub use botlink_client as client;
pub use botlink_protocol as protocol;

pub use botlink_client::{
    connect, with_connection, Client, ClientError, ConnectionConfig, Connection, ConnectionState,
    Transport, TransportError,
};
pub use botlink_protocol::{
    Command, CommandEntry, CommandRegistry, CorrelationKey, Packet, PacketCodec, Response,
    ResponseStatus,
};

#[cfg(test)]
mod tests {
    use super::*;
    use botlink_client::mock::MockTransport;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::Arc;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn get_name_robot() -> Arc<MockTransport> {
        Arc::new(MockTransport::new().with_responder(|written| {
            if written.first() == Some(&0x01) {
                vec![Packet::new(0x01, &b"Hello"[..]).encode().unwrap()]
            } else {
                Vec::new()
            }
        }))
    }

    #[tokio::test]
    async fn test_get_name_scenario() {
        init_tracing();
        let mock = get_name_robot();

        let registry = CommandRegistry::new()
            .with(CommandEntry::new("get_name", 0x01).with_decoder(|response| {
                let name = std::str::from_utf8(response.payload()).map_err(|e| e.to_string())?;
                Ok(json!({ "name": name }))
            }))
            .unwrap();

        let name = with_connection(mock.clone(), ConnectionConfig::default(), |conn| async move {
            Client::new(conn, registry).call("get_name", json!({})).await
        })
        .await
        .unwrap();

        assert_eq!(name, json!({ "name": "Hello" }));
        assert_eq!(mock.writes(), vec![Bytes::from_static(&[0x01, 0x00, 0x01])]);
        assert!(!mock.is_connected());
    }

    #[tokio::test]
    async fn test_connect_and_close() {
        init_tracing();
        let mock = get_name_robot();

        let conn = connect(mock.clone(), ConnectionConfig::default()).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);

        let reply = conn.send(Command::new(0x01, Bytes::new())).await.unwrap();
        assert_eq!(reply.unwrap().status, ResponseStatus::Success);

        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!mock.is_connected());
    }
}
