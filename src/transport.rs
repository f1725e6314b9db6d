//! TCP message transport between lease agents.
//!
//! One listener accepts incoming connections and turns decoded frames into
//! `RecvMessage` notices for the logic task; outgoing actions are routed to
//! per-peer messenger tasks that connect on demand. Delivery is best effort:
//! a dropped connection loses queued messages, which the lease protocol
//! already tolerates (renewals retry, staleness checks discard leftovers).

use std::collections::HashMap;

use crate::engine::{EngineAction, EngineNotice};
use crate::protocol::{decode_message, encode_message, LeaseMessage};
use crate::utils::VigilError;

use get_size::GetSize;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Frames larger than this are treated as corruption and drop the peer
/// connection.
const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// The lease agent's message transport.
pub(crate) struct LeaseTransport {
    _acceptor_handle: JoinHandle<()>,
    _sender_handle: JoinHandle<()>,
}

impl LeaseTransport {
    /// Binds the listen endpoint and spawns the acceptor and sender tasks.
    pub(crate) async fn new_and_setup(
        my_endpoint: &str,
        tx_notice: mpsc::UnboundedSender<EngineNotice>,
        rx_action: mpsc::UnboundedReceiver<EngineAction>,
    ) -> Result<Self, VigilError> {
        let listener = TcpListener::bind(my_endpoint).await?;
        pf_info!("transport listening on {}", my_endpoint);

        let acceptor_handle =
            tokio::spawn(Self::acceptor_task(listener, tx_notice));
        let sender_handle = tokio::spawn(Self::sender_task(rx_action));

        Ok(LeaseTransport {
            _acceptor_handle: acceptor_handle,
            _sender_handle: sender_handle,
        })
    }

    /// Accepts incoming peer connections, one reader task each.
    async fn acceptor_task(
        listener: TcpListener,
        tx_notice: mpsc::UnboundedSender<EngineNotice>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    pf_debug!("accepted connection from {}", addr);
                    tokio::spawn(Self::reader_task(stream, tx_notice.clone()));
                }
                Err(e) => {
                    pf_error!("error accepting connection: {}", e);
                }
            }
        }
    }

    /// Reads length-prefixed frames off one connection and feeds decoded
    /// messages to the logic task until the peer disconnects.
    async fn reader_task(
        mut stream: TcpStream,
        tx_notice: mpsc::UnboundedSender<EngineNotice>,
    ) {
        loop {
            let len = match stream.read_u64().await {
                Ok(len) => len,
                Err(_) => return, // peer closed
            };
            if len == 0 || len > MAX_FRAME_SIZE {
                pf_warn!("dropping connection with bad frame length {}", len);
                return;
            }
            let mut frame = vec![0u8; len as usize];
            if stream.read_exact(&mut frame).await.is_err() {
                return;
            }
            match decode_message(&frame) {
                Ok(msg) => {
                    if tx_notice
                        .send(EngineNotice::RecvMessage { msg })
                        .is_err()
                    {
                        return; // logic task gone
                    }
                }
                Err(e) => {
                    pf_warn!("dropping undecodable message: {}", e);
                }
            }
        }
    }

    /// Routes outgoing actions to per-peer messenger tasks, reconnecting a
    /// peer whose messenger has exited.
    async fn sender_task(mut rx_action: mpsc::UnboundedReceiver<EngineAction>) {
        let mut messengers: HashMap<String, mpsc::UnboundedSender<LeaseMessage>> =
            HashMap::new();

        while let Some(action) = rx_action.recv().await {
            let EngineAction::SendMessage { endpoint, msg } = action;

            let delivered = messengers
                .get(&endpoint)
                .is_some_and(|tx| tx.send(msg.clone()).is_ok());
            if !delivered {
                let (tx, rx) = mpsc::unbounded_channel();
                if tx.send(msg).is_err() {
                    pf_warn!("failed to queue message to {}", endpoint);
                }
                tokio::spawn(Self::messenger_task(endpoint.clone(), rx));
                messengers.insert(endpoint, tx);
            }
        }
    }

    /// Owns the outgoing connection to one peer; exits on any write error so
    /// the sender task reconnects lazily.
    async fn messenger_task(
        endpoint: String,
        mut rx: mpsc::UnboundedReceiver<LeaseMessage>,
    ) {
        let mut stream = match TcpStream::connect(&endpoint).await {
            Ok(stream) => stream,
            Err(e) => {
                pf_warn!("could not connect to {}: {}", endpoint, e);
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            pf_warn!("set_nodelay failed for {}: {}", endpoint, e);
        }
        pf_debug!("messenger connected to {}", endpoint);

        while let Some(msg) = rx.recv().await {
            let frame = match encode_message(&msg) {
                Ok(frame) => frame,
                Err(e) => {
                    pf_error!("failed to encode message: {}", e);
                    continue;
                }
            };
            pf_trace!(
                "sending {:?} to {}: {} B message, {} B frame",
                msg.header.msg_type,
                endpoint,
                msg.get_size(),
                frame.len()
            );
            if let Err(e) = Self::write_frame(&mut stream, &frame).await {
                pf_debug!("connection to {} dropped: {}", endpoint, e);
                return;
            }
        }
    }

    async fn write_frame(
        stream: &mut TcpStream,
        frame: &[u8],
    ) -> Result<(), VigilError> {
        stream.write_u64(frame.len() as u64).await?;
        stream.write_all(frame).await?;
        stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LeaseHeader, LeaseMessageType};
    use tokio::time::{timeout, Duration};

    fn ping(from: &str, message_id: u64) -> LeaseMessage {
        LeaseMessage::new(LeaseHeader {
            msg_type: LeaseMessageType::PingRequest,
            message_id,
            sender_endpoint: from.into(),
            sender_instance: 1,
            target_instance: 0,
            lease_instance: 0,
            duration_ms: 0,
            expiration_ms: 0,
            suspend_duration_ms: 0,
            arbitration_duration_ms: 0,
            is_two_way_termination: false,
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn messages_flow_between_transports() -> Result<(), VigilError> {
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_act_a, rx_act_a) = mpsc::unbounded_channel();
        let _a = LeaseTransport::new_and_setup(
            "127.0.0.1:41700",
            tx_a,
            rx_act_a,
        )
        .await?;

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_act_b, rx_act_b) = mpsc::unbounded_channel();
        let _b = LeaseTransport::new_and_setup(
            "127.0.0.1:41701",
            tx_b,
            rx_act_b,
        )
        .await?;

        tx_act_a.send(EngineAction::SendMessage {
            endpoint: "127.0.0.1:41701".into(),
            msg: ping("127.0.0.1:41700", 1),
        })?;
        let notice = timeout(Duration::from_secs(5), rx_b.recv())
            .await
            .map_err(|_| VigilError::msg("timed out waiting for message"))?;
        match notice {
            Some(EngineNotice::RecvMessage { msg }) => {
                assert_eq!(msg.header.message_id, 1);
                assert_eq!(msg.header.sender_endpoint, "127.0.0.1:41700");
            }
            _ => return Err(VigilError::msg("unexpected notice")),
        }

        // and the reverse direction over a fresh connection
        tx_act_b.send(EngineAction::SendMessage {
            endpoint: "127.0.0.1:41700".into(),
            msg: ping("127.0.0.1:41701", 1),
        })?;
        let notice = timeout(Duration::from_secs(5), rx_a.recv())
            .await
            .map_err(|_| VigilError::msg("timed out waiting for message"))?;
        assert!(matches!(
            notice,
            Some(EngineNotice::RecvMessage { .. })
        ));
        Ok(())
    }
}
