//! Firmware version handling and the download decision.
//!
//! The flashing micro-protocol itself lives behind `FirmwareDownloader`;
//! this module only decides when a session runs and provides the link it
//! runs over.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::NciFrame;
use crate::protocol::constants::INFRA_FW_MAJOR;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("No firmware image available")]
    NoImage,
    #[error("Download link error: {0}")]
    Link(String),
    #[error("No answer from bootloader within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("Bootloader rejected chunk {chunk} with status 0x{status:02X}")]
    Rejected { chunk: usize, status: u8 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Version triple reported by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub rom: u8,
    pub major: u8,
    pub minor: u8,
}

impl FirmwareVersion {
    pub fn new(rom: u8, major: u8, minor: u8) -> Self {
        Self { rom, major, minor }
    }

    /// All-zero sentinel reported by a blank or half-flashed controller.
    pub fn is_unknown(&self) -> bool {
        self.rom == 0 && self.major == 0 && self.minor == 0
    }

    /// Last three payload bytes of an NCI 1.x CORE_INIT_RSP.
    pub fn from_init_response(rsp: &NciFrame) -> Option<Self> {
        let payload = rsp.payload();
        match payload {
            [.., rom, major, minor] if payload.len() > 3 => Some(Self::new(*rom, *major, *minor)),
            _ => None,
        }
    }

    /// Manufacturer info of an NCI 2.0 CORE_RESET_NTF.
    ///
    /// Payload: reason, config status, NCI version, manufacturer id,
    /// info length, info bytes. The version is the tail of the info.
    pub fn from_reset_notification(ntf: &NciFrame) -> Option<Self> {
        let payload = ntf.payload();
        let info_len = *payload.get(4)? as usize;
        let info = payload.get(5..5 + info_len)?;
        match info {
            [.., rom, major, minor] => Some(Self::new(*rom, *major, *minor)),
            _ => None,
        }
    }

    /// Running firmware is at least `major.minor`.
    pub fn is_at_least(&self, major: u8, minor: u8) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}.{:02X}.{:02X}", self.rom, self.major, self.minor)
    }
}

/// Knobs that feed the download decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwarePolicy {
    /// Always flash, whatever the controller reports.
    pub force_download: bool,
    /// Allow flashing over an infra (test) build.
    pub allow_infra_override: bool,
    /// Oldest firmware bring-up accepts when a download fails.
    pub min_usable_major: u8,
    pub min_usable_minor: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceReason {
    UnknownVersion,
    Recovery,
    Configured,
}

/// Outcome of comparing the local image against the running firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareDecision {
    /// Running firmware matches the image (or no image is available).
    UpToDate,
    /// Image is newer; flash it.
    Update,
    /// Flash regardless of versions.
    Forced(ForceReason),
    /// Flashing would go the wrong way; keep the running firmware.
    Refused,
}

impl FirmwareDecision {
    /// Decide for this bring-up cycle. Never cached across power cycles.
    pub fn decide(
        local: Option<FirmwareVersion>,
        remote: FirmwareVersion,
        policy: &FirmwarePolicy,
        recovery_requested: bool,
    ) -> Self {
        if remote.is_unknown() {
            return FirmwareDecision::Forced(ForceReason::UnknownVersion);
        }
        if recovery_requested {
            return FirmwareDecision::Forced(ForceReason::Recovery);
        }
        let Some(local) = local else {
            return FirmwareDecision::UpToDate;
        };
        if policy.force_download {
            return FirmwareDecision::Forced(ForceReason::Configured);
        }
        if remote.major == INFRA_FW_MAJOR {
            return if policy.allow_infra_override {
                FirmwareDecision::Update
            } else {
                FirmwareDecision::Refused
            };
        }
        if local.major > remote.major
            || (local.major == remote.major && local.minor != remote.minor)
        {
            FirmwareDecision::Update
        } else if local.major == remote.major {
            FirmwareDecision::UpToDate
        } else {
            FirmwareDecision::Refused
        }
    }

    pub fn requires_download(&self) -> bool {
        matches!(self, FirmwareDecision::Update | FirmwareDecision::Forced(_))
    }
}

/// Flashing session flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashMode {
    Normal,
    /// Dummy re-flash run after the controller rejected its configuration.
    Recovery,
}

/// Byte exchange with the controller's bootloader.
pub trait DownloadLink {
    /// Send one chunk and wait for the bootloader's answer.
    fn transceive(&self, chunk: &[u8], timeout: Duration) -> Result<Vec<u8>, FirmwareError>;
}

/// Switches the physical link into download framing.
pub trait DownloadPort: Send + Sync {
    /// The returned link restores NCI framing when dropped.
    fn enter(&self) -> Result<Box<dyn DownloadLink + '_>, FirmwareError>;
}

/// External flashing session.
pub trait FirmwareDownloader: Send + Sync {
    /// Version of the image this downloader would flash.
    fn image_version(&self) -> Option<FirmwareVersion>;

    fn flash(&self, link: &dyn DownloadLink, mode: FlashMode) -> Result<(), FirmwareError>;
}

const CHUNK_ACK: u8 = 0x00;
const DEFAULT_CHUNK_SIZE: usize = 250;
const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Downloader that streams a raw image in length-prefixed chunks and
/// expects a one-byte status answer per chunk.
pub struct ImageDownloader {
    image: Vec<u8>,
    version: FirmwareVersion,
    chunk_size: usize,
    chunk_timeout: Duration,
}

impl ImageDownloader {
    pub fn new(image: Vec<u8>, version: FirmwareVersion) -> Self {
        Self {
            image,
            version,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P, version: FirmwareVersion) -> Result<Self, FirmwareError> {
        let image = std::fs::read(path)?;
        Ok(Self::new(image, version))
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, u16::MAX as usize);
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    fn frame_chunk(chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len() + 2);
        // Chunks are bounded by `chunk_size`, which fits in u16.
        let _ = out.write_u16::<BigEndian>(chunk.len() as u16);
        out.extend_from_slice(chunk);
        out
    }
}

impl FirmwareDownloader for ImageDownloader {
    fn image_version(&self) -> Option<FirmwareVersion> {
        if self.image.is_empty() {
            None
        } else {
            Some(self.version)
        }
    }

    fn flash(&self, link: &dyn DownloadLink, mode: FlashMode) -> Result<(), FirmwareError> {
        if self.image.is_empty() {
            return Err(FirmwareError::NoImage);
        }
        let total = self.image.len().div_ceil(self.chunk_size);
        info!(version = %self.version, chunks = total, mode = ?mode, "Flashing firmware image");

        for (index, chunk) in self.image.chunks(self.chunk_size).enumerate() {
            let answer = link.transceive(&Self::frame_chunk(chunk), self.chunk_timeout)?;
            match answer.first() {
                Some(&CHUNK_ACK) => debug!(chunk = index + 1, total, "Chunk accepted"),
                Some(&status) => {
                    warn!(chunk = index, status = %format_args!("0x{:02X}", status), "Chunk rejected");
                    return Err(FirmwareError::Rejected { chunk: index, status });
                }
                None => return Err(FirmwareError::Link("empty bootloader answer".into())),
            }
        }
        info!("Firmware image flashed");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Downloader that records its sessions and pings the link once per flash.
    pub(crate) struct RecordingDownloader {
        pub version: Option<FirmwareVersion>,
        pub sessions: Mutex<Vec<FlashMode>>,
        pub answers: Mutex<Vec<Vec<u8>>>,
        failures_left: AtomicU32,
    }

    impl RecordingDownloader {
        pub(crate) fn new(version: Option<FirmwareVersion>) -> Self {
            Self {
                version,
                sessions: Mutex::new(Vec::new()),
                answers: Mutex::new(Vec::new()),
                failures_left: AtomicU32::new(0),
            }
        }

        pub(crate) fn failing(self, times: u32) -> Self {
            self.failures_left.store(times, Ordering::SeqCst);
            self
        }

        pub(crate) fn session_count(&self) -> usize {
            self.sessions.lock().len()
        }
    }

    impl FirmwareDownloader for RecordingDownloader {
        fn image_version(&self) -> Option<FirmwareVersion> {
            self.version
        }

        fn flash(&self, link: &dyn DownloadLink, mode: FlashMode) -> Result<(), FirmwareError> {
            self.sessions.lock().push(mode);
            let answer = link.transceive(&[0x00, 0x01, 0xA5], Duration::from_millis(500))?;
            self.answers.lock().push(answer);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(FirmwareError::Link("scripted failure".into()));
            }
            Ok(())
        }
    }

    /// Link answering each chunk with a fixed status and recording chunks.
    struct ScriptedLink {
        status: u8,
        chunks: Mutex<Vec<Vec<u8>>>,
    }

    impl DownloadLink for ScriptedLink {
        fn transceive(&self, chunk: &[u8], _timeout: Duration) -> Result<Vec<u8>, FirmwareError> {
            self.chunks.lock().push(chunk.to_vec());
            Ok(vec![self.status])
        }
    }

    fn policy() -> FirmwarePolicy {
        FirmwarePolicy::default()
    }

    #[test]
    fn test_newer_local_major_updates() {
        let d = FirmwareDecision::decide(
            Some(FirmwareVersion::new(0x11, 2, 0)),
            FirmwareVersion::new(0x11, 1, 0),
            &policy(),
            false,
        );
        assert_eq!(d, FirmwareDecision::Update);
        assert!(!matches!(d, FirmwareDecision::Forced(_)));
    }

    #[test]
    fn test_unknown_remote_forces_update() {
        let d = FirmwareDecision::decide(
            Some(FirmwareVersion::new(0x11, 2, 0)),
            FirmwareVersion::default(),
            &policy(),
            false,
        );
        assert_eq!(d, FirmwareDecision::Forced(ForceReason::UnknownVersion));
        assert!(d.requires_download());
    }

    #[test]
    fn test_infra_build_refused_without_override() {
        let infra = FirmwareVersion::new(0x11, INFRA_FW_MAJOR, 0x02);
        let local = Some(FirmwareVersion::new(0x11, INFRA_FW_MAJOR, 0x05));
        assert_eq!(
            FirmwareDecision::decide(local, infra, &policy(), false),
            FirmwareDecision::Refused
        );
        let allow = FirmwarePolicy {
            allow_infra_override: true,
            ..policy()
        };
        assert_eq!(
            FirmwareDecision::decide(local, infra, &allow, false),
            FirmwareDecision::Update
        );
    }

    #[test]
    fn test_downgrade_refused() {
        let d = FirmwareDecision::decide(
            Some(FirmwareVersion::new(0x11, 1, 9)),
            FirmwareVersion::new(0x11, 2, 0),
            &policy(),
            false,
        );
        assert_eq!(d, FirmwareDecision::Refused);
        assert!(!d.requires_download());
    }

    #[test]
    fn test_recovery_and_configured_force() {
        let same = FirmwareVersion::new(0x11, 1, 0x0E);
        assert_eq!(
            FirmwareDecision::decide(Some(same), same, &policy(), true),
            FirmwareDecision::Forced(ForceReason::Recovery)
        );
        let forced = FirmwarePolicy {
            force_download: true,
            ..policy()
        };
        assert_eq!(
            FirmwareDecision::decide(Some(same), same, &forced, false),
            FirmwareDecision::Forced(ForceReason::Configured)
        );
        assert_eq!(
            FirmwareDecision::decide(Some(same), same, &policy(), false),
            FirmwareDecision::UpToDate
        );
    }

    #[test]
    fn test_no_image_keeps_running_firmware() {
        let d = FirmwareDecision::decide(None, FirmwareVersion::new(0x11, 1, 0), &policy(), false);
        assert_eq!(d, FirmwareDecision::UpToDate);
    }

    #[test]
    fn test_version_from_init_response() {
        let rsp = NciFrame::from_bytes(vec![0x40, 0x01, 0x05, 0x00, 0x1E, 0x11, 0x01, 0x0E]).unwrap();
        assert_eq!(
            FirmwareVersion::from_init_response(&rsp),
            Some(FirmwareVersion::new(0x11, 0x01, 0x0E))
        );
        let short = NciFrame::from_bytes(vec![0x40, 0x01, 0x01, 0x00]).unwrap();
        assert_eq!(FirmwareVersion::from_init_response(&short), None);
    }

    #[test]
    fn test_version_from_reset_notification() {
        let ntf = NciFrame::from_bytes(vec![
            0x60, 0x00, 0x09, 0x02, 0x01, 0x20, 0x04, 0x04, 0x51, 0x12, 0x02, 0x30,
        ])
        .unwrap();
        let v = FirmwareVersion::from_reset_notification(&ntf).unwrap();
        assert_eq!(v, FirmwareVersion::new(0x12, 0x02, 0x30));
        assert_eq!(v.to_string(), "12.02.30");
        assert!(v.is_at_least(2, 0x30));
        assert!(!v.is_at_least(2, 0x31));
    }

    #[test]
    fn test_image_downloader_chunks() {
        let link = ScriptedLink {
            status: 0x00,
            chunks: Mutex::new(Vec::new()),
        };
        let dl = ImageDownloader::new(vec![0xAB; 5], FirmwareVersion::new(1, 2, 3)).with_chunk_size(2);
        dl.flash(&link, FlashMode::Normal).unwrap();
        let chunks = link.chunks.lock();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], vec![0x00, 0x02, 0xAB, 0xAB]);
        assert_eq!(chunks[2], vec![0x00, 0x01, 0xAB]);
    }

    #[test]
    fn test_image_downloader_stops_on_reject() {
        let link = ScriptedLink {
            status: 0x03,
            chunks: Mutex::new(Vec::new()),
        };
        let dl = ImageDownloader::new(vec![0xAB; 5], FirmwareVersion::new(1, 2, 3)).with_chunk_size(2);
        assert!(matches!(
            dl.flash(&link, FlashMode::Normal),
            Err(FirmwareError::Rejected { chunk: 0, status: 0x03 })
        ));
        assert_eq!(link.chunks.lock().len(), 1);
        assert!(ImageDownloader::new(Vec::new(), FirmwareVersion::default())
            .image_version()
            .is_none());
    }
}
