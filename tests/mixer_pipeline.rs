//! End-to-end pipeline tests: datagrams in, mixed frames out, driven
//! through the scheduler with an in-memory transport.

use std::collections::{BTreeSet, VecDeque};
use std::f32::consts::PI;
use std::sync::atomic::Ordering;

use glam::{Quat, Vec3};
use mixer_core::{Error, PeerId, FRAME_SAMPLES, SAMPLE_PHASE_DELAY_AT_90};
use network::protocol::{
    self, Datagram, MicrophoneFrame, PacketType, HEADER_LEN,
};
use network::transport::Transport;
use soundstage::scheduler::FrameScheduler;
use soundstage::MixerConfig;

/// Recording transport: tests enqueue inbound datagrams and inspect
/// everything the scheduler sends.
#[derive(Default)]
struct FakeTransport {
    peers: BTreeSet<PeerId>,
    inbound: VecDeque<Datagram>,
    sent: Vec<Datagram>,
    rejecting: BTreeSet<PeerId>,
}

impl FakeTransport {
    fn add_peer(&mut self) -> PeerId {
        let peer = PeerId::new();
        self.peers.insert(peer);
        peer
    }

    fn push_inbound(&mut self, peer: PeerId, datagram: Vec<u8>) {
        self.inbound.push_back((peer, datagram));
    }

    fn sent_to(&self, peer: PeerId, packet_type: PacketType) -> Vec<&[u8]> {
        self.sent
            .iter()
            .filter(|(to, bytes)| {
                *to == peer && protocol::parse_header(bytes).ok() == Some(packet_type)
            })
            .map(|(_, bytes)| bytes.as_slice())
            .collect()
    }
}

impl Transport for FakeTransport {
    fn send_datagram(&mut self, peer: PeerId, payload: &[u8]) -> Result<(), Error> {
        if !self.peers.contains(&peer) {
            return Err(Error::Network(format!("peer {} has no address", peer)));
        }
        if self.rejecting.contains(&peer) {
            return Err(Error::Backpressure(peer));
        }
        self.sent.push((peer, payload.to_vec()));
        Ok(())
    }

    fn receive_datagrams(&mut self) -> Vec<Datagram> {
        self.inbound.drain(..).collect()
    }

    fn is_connected(&self, peer: PeerId) -> bool {
        self.peers.contains(&peer)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.iter().copied().collect()
    }
}

fn mic_packet(
    sequence: u16,
    position: Vec3,
    orientation: Quat,
    samples: Vec<i16>,
    echo: bool,
) -> Vec<u8> {
    MicrophoneFrame {
        sequence,
        stereo: false,
        position,
        orientation,
        samples,
    }
    .encode(echo)
}

fn ramp_samples() -> Vec<i16> {
    (0..FRAME_SAMPLES as i16).map(|i| i * 100).collect()
}

fn scheduler() -> FrameScheduler<FakeTransport> {
    FrameScheduler::new(FakeTransport::default(), MixerConfig::default())
}

#[tokio::test]
async fn mixed_frames_flow_end_to_end() {
    let mut scheduler = scheduler();
    let listener = scheduler.transport_mut().add_peer();
    let talker = scheduler.transport_mut().add_peer();

    // Listener at the origin facing -Z, talker ten meters dead ahead,
    // facing back at the listener.
    let transport = scheduler.transport_mut();
    transport.push_inbound(
        listener,
        mic_packet(0, Vec3::ZERO, Quat::IDENTITY, vec![0; FRAME_SAMPLES], false),
    );
    let talker_samples = ramp_samples();
    transport.push_inbound(
        talker,
        mic_packet(
            0,
            Vec3::new(0.0, 0.0, -10.0),
            Quat::from_rotation_y(PI),
            talker_samples.clone(),
            false,
        ),
    );

    scheduler.run_tick();

    let frames = scheduler
        .transport()
        .sent_to(listener, PacketType::MixedAudio);
    assert_eq!(frames.len(), 1);
    let (sequence, mix) = protocol::decode_mixed_audio(&frames[0][HEADER_LEN..]).unwrap();
    assert_eq!(sequence, 0);

    // Collinear source: both ears equal, scaled by the distance curve.
    let attenuation = 0.3f32
        .powf(2.5f32.ln() / 2.5f32.ln() + 0.5 * 100.0f32.ln() / 2.5f32.ln() - 1.0)
        .min(1.0);
    for (j, &sample) in talker_samples.iter().enumerate() {
        let expected = (sample as f32 * attenuation) as i16;
        assert!((mix[2 * j] as i32 - expected as i32).abs() <= 1);
        assert_eq!(mix[2 * j], mix[2 * j + 1]);
    }

    // The talker's own mix carries the (silent) listener: all zeros.
    let talker_frames = scheduler
        .transport()
        .sent_to(talker, PacketType::MixedAudio);
    assert_eq!(talker_frames.len(), 1);
}

#[tokio::test]
async fn hard_right_talker_is_panned_in_the_mix() {
    let mut scheduler = scheduler();
    let listener = scheduler.transport_mut().add_peer();
    let talker = scheduler.transport_mut().add_peer();

    let transport = scheduler.transport_mut();
    transport.push_inbound(
        listener,
        mic_packet(0, Vec3::ZERO, Quat::IDENTITY, vec![0; FRAME_SAMPLES], false),
    );
    transport.push_inbound(
        talker,
        mic_packet(
            0,
            Vec3::new(10.0, 0.0, 0.0),
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
            ramp_samples(),
            false,
        ),
    );

    scheduler.run_tick();

    let frames = scheduler
        .transport()
        .sent_to(listener, PacketType::MixedAudio);
    let (_, mix) = protocol::decode_mixed_audio(&frames[0][HEADER_LEN..]).unwrap();

    let delay = SAMPLE_PHASE_DELAY_AT_90 as usize;
    // The left ear leads with ring history (silence for a fresh stream).
    for k in 0..delay {
        assert_eq!(mix[2 * k], 0);
    }
    // Pick a frame where the ramp is loud: right ear carries roughly
    // twice the left ear's delayed sample.
    let j = 100;
    let right = mix[2 * j + 1] as f32;
    let left_delayed = mix[2 * (j + delay)] as f32;
    assert!(right > 0.0);
    assert!((left_delayed / right - 0.5).abs() < 0.05);
}

#[tokio::test]
async fn sequence_numbers_increment_per_delivered_frame() {
    let mut scheduler = scheduler();
    let listener = scheduler.transport_mut().add_peer();
    let talker = scheduler.transport_mut().add_peer();

    for seq in 0..3u16 {
        let transport = scheduler.transport_mut();
        transport.push_inbound(
            listener,
            mic_packet(seq, Vec3::ZERO, Quat::IDENTITY, ramp_samples(), false),
        );
        transport.push_inbound(
            talker,
            mic_packet(
                seq,
                Vec3::new(0.0, 0.0, -5.0),
                Quat::from_rotation_y(PI),
                ramp_samples(),
                false,
            ),
        );
        scheduler.run_tick();
    }

    let sequences: Vec<u16> = scheduler
        .transport()
        .sent_to(listener, PacketType::MixedAudio)
        .iter()
        .map(|bytes| {
            protocol::decode_mixed_audio(&bytes[HEADER_LEN..])
                .unwrap()
                .0
        })
        .collect();
    assert_eq!(sequences, vec![0, 1, 2]);
}

#[tokio::test]
async fn backpressure_drops_the_frame_but_advances_the_sequence() {
    let mut scheduler = scheduler();
    let listener = scheduler.transport_mut().add_peer();

    for seq in 0..3u16 {
        scheduler.transport_mut().push_inbound(
            listener,
            mic_packet(seq, Vec3::ZERO, Quat::IDENTITY, ramp_samples(), true),
        );
        if seq == 1 {
            scheduler.transport_mut().rejecting.insert(listener);
        } else {
            scheduler.transport_mut().rejecting.remove(&listener);
        }
        scheduler.run_tick();
    }

    let sequences: Vec<u16> = scheduler
        .transport()
        .sent_to(listener, PacketType::MixedAudio)
        .iter()
        .map(|bytes| {
            protocol::decode_mixed_audio(&bytes[HEADER_LEN..])
                .unwrap()
                .0
        })
        .collect();
    // The middle frame was dropped, not renumbered.
    assert_eq!(sequences, vec![0, 2]);
}

#[tokio::test]
async fn mute_environment_is_rebroadcast_to_everyone_else() {
    let mut scheduler = scheduler();
    let sender = scheduler.transport_mut().add_peer();
    let other_a = scheduler.transport_mut().add_peer();
    let other_b = scheduler.transport_mut().add_peer();

    let mute = vec![
        protocol::PACKET_MAGIC,
        protocol::PROTOCOL_VERSION,
        PacketType::MuteEnvironment as u8,
    ];
    scheduler
        .transport_mut()
        .push_inbound(sender, mute.clone());

    scheduler.run_tick();

    for other in [other_a, other_b] {
        let relayed = scheduler
            .transport()
            .sent_to(other, PacketType::MuteEnvironment);
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0], mute.as_slice());
    }
    assert!(scheduler
        .transport()
        .sent_to(sender, PacketType::MuteEnvironment)
        .is_empty());
}

#[tokio::test]
async fn malformed_packets_are_counted_and_dropped() {
    let mut scheduler = scheduler();
    let peer = scheduler.transport_mut().add_peer();

    // Wrong magic, truncated payload, and a client-bound type.
    scheduler.transport_mut().push_inbound(peer, vec![0x00, 0x01, 0x02]);
    scheduler.transport_mut().push_inbound(
        peer,
        vec![protocol::PACKET_MAGIC, protocol::PROTOCOL_VERSION, 0, 1],
    );
    scheduler.transport_mut().push_inbound(
        peer,
        vec![protocol::PACKET_MAGIC, protocol::PROTOCOL_VERSION, 5, 0, 0],
    );

    scheduler.run_tick();

    assert_eq!(scheduler.stats().bad_packets, 3);
    assert!(scheduler
        .transport()
        .sent_to(peer, PacketType::MixedAudio)
        .is_empty());
}

#[tokio::test]
async fn gated_source_leaves_the_mix_byte_identical() {
    let run = |with_whisper: bool| -> Vec<u8> {
        let mut scheduler = scheduler();
        let listener = scheduler.transport_mut().add_peer();
        let talker = scheduler.transport_mut().add_peer();

        let transport = scheduler.transport_mut();
        transport.push_inbound(
            listener,
            mic_packet(0, Vec3::ZERO, Quat::IDENTITY, vec![0; FRAME_SAMPLES], false),
        );
        transport.push_inbound(
            talker,
            mic_packet(
                0,
                Vec3::new(0.0, 0.0, -3.0),
                Quat::from_rotation_y(PI),
                ramp_samples(),
                false,
            ),
        );
        if with_whisper {
            let whisper = scheduler.transport_mut().add_peer();
            scheduler.transport_mut().push_inbound(
                whisper,
                mic_packet(
                    0,
                    Vec3::new(0.0, 0.0, -200.0),
                    Quat::from_rotation_y(PI),
                    vec![1; FRAME_SAMPLES],
                    false,
                ),
            );
        }
        scheduler.run_tick();
        scheduler
            .transport()
            .sent_to(listener, PacketType::MixedAudio)[0]
            .to_vec()
    };

    let baseline = run(false);
    let with_whisper = run(true);
    // Same sequence, same samples: the gated whisper left no trace.
    assert_eq!(baseline, with_whisper);
}

#[tokio::test]
async fn echo_requested_listener_hears_themselves() {
    let mut scheduler = scheduler();
    let listener = scheduler.transport_mut().add_peer();

    let samples = ramp_samples();
    scheduler.transport_mut().push_inbound(
        listener,
        mic_packet(0, Vec3::ZERO, Quat::IDENTITY, samples.clone(), true),
    );

    scheduler.run_tick();

    let frames = scheduler
        .transport()
        .sent_to(listener, PacketType::MixedAudio);
    let (_, mix) = protocol::decode_mixed_audio(&frames[0][HEADER_LEN..]).unwrap();
    for (j, &expected) in samples.iter().enumerate() {
        assert_eq!(mix[2 * j], expected);
        assert_eq!(mix[2 * j + 1], expected);
    }
}

#[tokio::test(start_paused = true)]
async fn tick_cadence_holds_with_ample_slack() {
    let mut scheduler = scheduler();
    let stop = scheduler.stop_handle();

    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(505)).await;
        stop.store(true, Ordering::Relaxed);
    });

    scheduler.run().await;

    // 505 ms of virtual time at 10 ms per tick.
    let ticks = scheduler.stats().num_stat_frames;
    assert!(
        (48..=53).contains(&ticks),
        "expected ~50 ticks, got {}",
        ticks
    );
    // With a full sleep every tick the throttle never engages.
    assert_eq!(scheduler.throttle().performance_throttling_ratio(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn stream_stats_are_emitted_once_per_second() {
    let mut scheduler = scheduler();
    let listener = scheduler.transport_mut().add_peer();

    for seq in 0..105u16 {
        scheduler.transport_mut().push_inbound(
            listener,
            mic_packet(seq, Vec3::ZERO, Quat::IDENTITY, ramp_samples(), true),
        );
        scheduler.run_tick();
        tokio::time::advance(std::time::Duration::from_millis(10)).await;
    }

    let stats_packets = scheduler
        .transport()
        .sent_to(listener, PacketType::StreamStats);
    assert_eq!(stats_packets.len(), 1);

    let stats = protocol::StreamStats::decode(&stats_packets[0][HEADER_LEN..]).unwrap();
    assert!((stats.average_listeners_per_frame - 1.0).abs() < 0.05);
    assert_eq!(stats.bad_packets, 0);
}
