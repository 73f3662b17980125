//! Link wrapper that reports every physical frame to an observer.

use std::sync::Arc;

use super::traits::{ChannelError, FrameChannel, LinkConfig, ResetMode};
use crate::events::{HalEvent, HalObserver, PacketDirection};
use crate::protocol::message_type_of;

/// Bytes of each frame copied into `Packet` events.
const PACKET_PREVIEW: usize = 32;

pub struct ObservableChannel {
    inner: Arc<dyn FrameChannel>,
    observer: Arc<dyn HalObserver>,
}

impl ObservableChannel {
    pub fn new(inner: Arc<dyn FrameChannel>, observer: Arc<dyn HalObserver>) -> Self {
        Self { inner, observer }
    }

    fn emit_packet(&self, direction: PacketDirection, data: &[u8]) {
        self.observer.on_event(&HalEvent::Packet {
            direction,
            message_type: message_type_of(data),
            length: data.len(),
            data: Some(data.iter().take(PACKET_PREVIEW).cloned().collect()),
        });
    }
}

impl FrameChannel for ObservableChannel {
    fn open(&self, config: &LinkConfig) -> Result<(), ChannelError> {
        self.inner.open(config)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.emit_packet(PacketDirection::Rx, &buf[..n]);
        }
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> Result<usize, ChannelError> {
        let n = self.inner.write(data)?;
        self.emit_packet(PacketDirection::Tx, data);
        Ok(n)
    }

    fn reset(&self, mode: ResetMode) -> Result<(), ChannelError> {
        self.inner.reset(mode)
    }

    fn close(&self) {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;
    use crate::events::tests::RecordingObserver;
    use crate::protocol::MessageType;
    use crate::protocol::constants::CORE_RESET_CMD;

    #[test]
    fn test_writes_emit_tx_packets() {
        let mock = Arc::new(MockChannel::new());
        let observer = Arc::new(RecordingObserver::default());
        let channel = ObservableChannel::new(mock.clone(), observer.clone());
        channel.open(&LinkConfig::default()).unwrap();
        channel.write(&CORE_RESET_CMD).unwrap();

        let events = observer.events.lock();
        assert_eq!(events.len(), 1);
        match &events[0] {
            HalEvent::Packet {
                direction,
                message_type,
                length,
                ..
            } => {
                assert_eq!(*direction, PacketDirection::Tx);
                assert_eq!(*message_type, Some(MessageType::Command));
                assert_eq!(*length, 4);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_failed_write_is_not_reported() {
        let mock = Arc::new(MockChannel::new());
        let observer = Arc::new(RecordingObserver::default());
        let channel = ObservableChannel::new(mock, observer.clone());
        assert!(channel.write(&CORE_RESET_CMD).is_err());
        assert!(observer.events.lock().is_empty());
    }
}
