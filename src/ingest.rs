//! Datagram intake.
//!
//! Runs at the top of every tick, before pre-frame bookkeeping, so all
//! source mutation is serialized onto the mixer thread at one safe
//! point. Bad packets are dropped and counted; everything else routes
//! into the registry or back out as a relay.

use audio::registry::Registry;
use log::debug;
use mixer_core::{Error, PeerId};
use network::protocol::{self, PacketType, HEADER_LEN};
use network::transport::Transport;

use crate::stats::MixStatistics;

/// Drain and route every pending datagram.
pub fn drain_datagrams<T: Transport>(
    transport: &mut T,
    registry: &mut Registry,
    stats: &mut MixStatistics,
) {
    for (peer, datagram) in transport.receive_datagrams() {
        match route_datagram(peer, &datagram, transport, registry) {
            Ok(()) => {}
            Err(Error::BadPacket(reason)) => {
                stats.bad_packets += 1;
                debug!("dropping packet from {}: {}", peer, reason);
            }
            Err(e) => debug!("ingest error from {}: {}", peer, e),
        }
    }
}

fn route_datagram<T: Transport>(
    peer: PeerId,
    datagram: &[u8],
    transport: &mut T,
    registry: &mut Registry,
) -> Result<(), Error> {
    let packet_type = protocol::parse_header(datagram)?;
    let payload = &datagram[HEADER_LEN..];

    match packet_type {
        PacketType::MicrophoneAudioNoEcho => {
            let frame = protocol::MicrophoneFrame::decode(payload)?;
            ingest_microphone(registry, peer, frame, false);
            Ok(())
        }
        PacketType::MicrophoneAudioWithEcho => {
            let frame = protocol::MicrophoneFrame::decode(payload)?;
            ingest_microphone(registry, peer, frame, true);
            Ok(())
        }
        PacketType::InjectAudio => {
            let frame = protocol::InjectFrame::decode(payload)?;
            let accepted = registry.ensure_client(peer).ingest_injector(
                frame.stream_id,
                frame.sequence,
                frame.radius,
                frame.attenuation_ratio,
                frame.position,
                frame.orientation,
                &frame.samples,
            );
            if !accepted {
                debug!("stale injector frame {} from {}", frame.sequence, peer);
            }
            Ok(())
        }
        PacketType::SilentAudioFrame => {
            let frame = protocol::SilentFrame::decode(payload)?;
            registry.ensure_client(peer).ingest_microphone_silence(
                frame.sequence,
                frame.position,
                frame.orientation,
                frame.num_silent_samples as usize,
            );
            Ok(())
        }
        PacketType::MuteEnvironment => {
            // Relay verbatim to everyone else; delivery is best-effort
            // like any other datagram.
            for other in transport.connected_peers() {
                if other != peer {
                    if let Err(e) = transport.send_datagram(other, datagram) {
                        debug!("mute relay to {} failed: {}", other, e);
                    }
                }
            }
            Ok(())
        }
        PacketType::MixedAudio | PacketType::StreamStats => {
            Err(Error::BadPacket("client-bound packet type"))
        }
    }
}

fn ingest_microphone(
    registry: &mut Registry,
    peer: PeerId,
    frame: protocol::MicrophoneFrame,
    loopback: bool,
) {
    let accepted = registry.ensure_client(peer).ingest_microphone(
        frame.sequence,
        frame.stereo,
        loopback,
        frame.position,
        frame.orientation,
        &frame.samples,
    );
    if !accepted {
        debug!("stale microphone frame {} from {}", frame.sequence, peer);
    }
}
