//! Directory layout a server publishes and a client discovers.
//!
//! A server writes three keys below `device/vchan/<channel>` in its own home:
//!
//! | key             | value                                                |
//! |-----------------|------------------------------------------------------|
//! | `version`       | wire version, decimal                                |
//! | `ring-ref`      | grant reference (v2) or frame number (v1), non-zero |
//! | `event-channel` | unbound port offered to the client, non-zero         |
//!
//! The client reads them through the absolute path
//! `/local/domain/<server>/device/vchan/<channel>`.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;
use vchan_hv::{DirectorySession, DomainId, FrameNumber, GrantRef, HvResult, Port};

use crate::config::WireVersion;
use crate::error::{DiscoveryFailure, VchanError, VchanResult};
use crate::mapping::RingReference;

pub const VCHAN_DIR: &str = "device/vchan";
pub const VERSION_KEY: &str = "version";
pub const RING_REF_KEY: &str = "ring-ref";
pub const EVENT_CHANNEL_KEY: &str = "event-channel";

/// Channel number distinguishing several links between the same two domains.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelNumber(pub u32);

impl fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Channel scope relative to the publishing domain's home.
pub fn local_scope(channel: ChannelNumber) -> String {
    format!("{VCHAN_DIR}/{channel}")
}

/// Channel scope of `domain` as seen from any other domain.
pub fn remote_scope(domain: DomainId, channel: ChannelNumber) -> String {
    format!("{}/{}", domain.home(), local_scope(channel))
}

/// What a server offers on a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Offer {
    pub reference: RingReference,
    pub port: Port,
}

impl Offer {
    pub fn version(&self) -> WireVersion {
        self.reference.version()
    }
}

pub(crate) fn publish(
    session: &dyn DirectorySession,
    channel: ChannelNumber,
    offer: &Offer,
) -> HvResult<()> {
    let scope = local_scope(channel);
    session.write(&format!("{scope}/{VERSION_KEY}"), &offer.version().to_string())?;
    session.write(&format!("{scope}/{RING_REF_KEY}"), &offer.reference.to_string())?;
    session.write(&format!("{scope}/{EVENT_CHANNEL_KEY}"), &offer.port.to_string())?;
    debug!(%channel, reference = %offer.reference, port = %offer.port, "rendezvous published");
    Ok(())
}

pub(crate) fn remove(session: &dyn DirectorySession, channel: ChannelNumber) -> HvResult<()> {
    session.remove(&local_scope(channel))
}

/// Reads and validates what `domain` published on `channel`.
pub(crate) fn discover(
    session: &dyn DirectorySession,
    domain: DomainId,
    channel: ChannelNumber,
) -> VchanResult<Offer> {
    let scope = remote_scope(domain, channel);
    let fail = |reason| VchanError::Discovery {
        domain,
        channel,
        reason,
    };

    // Publication writes the version first, so reading it last never pairs a
    // fresh reference with a missing or stale version.
    let raw_ref = session.read(&format!("{scope}/{RING_REF_KEY}"))?;
    let raw_port = session.read(&format!("{scope}/{EVENT_CHANNEL_KEY}"))?;
    let version = match session.read(&format!("{scope}/{VERSION_KEY}"))? {
        None => WireVersion::LOWEST,
        Some(raw) => {
            WireVersion::parse(&raw).ok_or_else(|| fail(DiscoveryFailure::UnsupportedVersion(raw)))?
        }
    };

    let reference = parse_reference(version, raw_ref).map_err(fail)?;
    let port = parse_required(EVENT_CHANNEL_KEY, raw_port)
        .and_then(|value| narrow(EVENT_CHANNEL_KEY, value))
        .map(Port)
        .map_err(fail)?;

    debug!(%domain, %channel, %version, %reference, %port, "rendezvous discovered");
    Ok(Offer { reference, port })
}

fn parse_reference(
    version: WireVersion,
    raw: Option<String>,
) -> Result<RingReference, DiscoveryFailure> {
    let value = parse_required(RING_REF_KEY, raw)?;
    Ok(match version {
        WireVersion::V1 => RingReference::Frame(FrameNumber(value)),
        WireVersion::V2 => RingReference::Grant(GrantRef(narrow(RING_REF_KEY, value)?)),
    })
}

fn parse_required(key: &'static str, raw: Option<String>) -> Result<u64, DiscoveryFailure> {
    let raw = raw.ok_or(DiscoveryFailure::Missing { key })?;
    let value = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| DiscoveryFailure::Malformed {
            key,
            value: raw.clone(),
        })?;
    if value == 0 {
        return Err(DiscoveryFailure::Zero { key });
    }
    Ok(value)
}

fn narrow(key: &'static str, value: u64) -> Result<u32, DiscoveryFailure> {
    u32::try_from(value).map_err(|_| DiscoveryFailure::Malformed {
        key,
        value: value.to_string(),
    })
}
