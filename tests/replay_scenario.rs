mod common;

use std::io::Cursor;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use common::{serve_fc, FcRecord, FcScript, MODE_RANGES};
use fl2sitl::bridge::{
    self, Action, OperatorCommand, ReplayController, SessionPhase, DISARM_WAIT,
};
use fl2sitl::config::{Config, FailsafeMode};
use fl2sitl::logsource::LogSource;
use fl2sitl::modes::{parse_mode_ranges, FlightMode};
use fl2sitl::msp::{FcInfo, LinkStatus};
use fl2sitl::replay::{SimulationSample, STATUS_ARMED, STATUS_FAILSAFE};
use fl2sitl::rx::RcChannels;
use fl2sitl::sim::dataref::{Subscription, HANDSHAKE_SENTINEL, STATE_DATAREFS};

/// (status, throttle) per sample: armed at 2, failsafe at 4, cleared at 5
const SCENARIO: [(u8, u16); 5] = [
    (0, 1000),
    (STATUS_ARMED, 1100),
    (STATUS_ARMED, 1200),
    (STATUS_ARMED | STATUS_FAILSAFE, 1300),
    (STATUS_ARMED, 1450),
];

const FAILSAFE_THROTTLE: u16 = 800;

#[derive(Debug, PartialEq, Eq)]
enum Observed {
    ReadyToArm,
    Armed,
    Frame { sample: usize, throttle: u16 },
}

fn frames(actions: &[Action]) -> Vec<RcChannels> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Channels(ch) => Some(*ch),
            _ => None,
        })
        .collect()
}

#[test]
fn scenario_through_controller() {
    let mut ctl = ReplayController::new(true, FailsafeMode::Throttle(FAILSAFE_THROTTLE));
    ctl.on_connected(&FcInfo {
        mode_ranges: parse_mode_ranges(&MODE_RANGES),
        ..FcInfo::default()
    });

    let samples: Vec<SimulationSample> = SCENARIO
        .iter()
        .map(|&(status, thr)| SimulationSample {
            status,
            sticks: [1500, 1500, 1500, thr],
            rssi: 80,
            ..SimulationSample::default()
        })
        .collect();

    let mut observed = Vec::new();
    ctl.on_sample(&samples[0]);

    assert_eq!(ctl.on_status(LinkStatus::ReadyToArm), vec![Action::OpenGate]);
    observed.push(Observed::ReadyToArm);

    let arm_frame = frames(&ctl.on_sample(&samples[1]));
    assert_eq!(arm_frame.last().unwrap()[4], 1900);

    ctl.on_status(LinkStatus::Armed);
    observed.push(Observed::Armed);
    assert_eq!(ctl.phase(), SessionPhase::Armed);

    for (i, sample) in samples.iter().enumerate().skip(2) {
        for frame in frames(&ctl.on_sample(sample)) {
            observed.push(Observed::Frame {
                sample: i + 1,
                throttle: frame[3],
            });
        }
    }

    assert_eq!(
        observed,
        vec![
            Observed::ReadyToArm,
            Observed::Armed,
            Observed::Frame { sample: 3, throttle: 1200 },
            Observed::Frame { sample: 4, throttle: FAILSAFE_THROTTLE },
            Observed::Frame { sample: 5, throttle: 1450 },
        ]
    );

    // Mode never changed from Acro, so AUX2 stayed at its initial value
    assert_eq!(ctl.channels()[5], 1001);
    assert_eq!(samples[4].mode, FlightMode::Acro);
}

fn scenario_log() -> String {
    let mut log = String::from(
        "{\"type\":\"meta\",\"name\":\"scenario\",\"craft\":\"quad\",\"acc_1g\":4096}\n",
    );
    for (i, (status, thr)) in SCENARIO.iter().enumerate() {
        log.push_str(&format!(
            "{{\"type\":\"sample\",\"stamp\":{},\"lat\":54.1,\"lon\":-4.7,\"alt\":{},\
             \"acc_z\":4096,\"ail\":1500,\"ele\":1500,\"rud\":1500,\"thr\":{},\
             \"rssi\":80,\"status\":{}}}\n",
            i as u64 * 1_000_000,
            10 + i,
            thr,
            status
        ));
    }
    log
}

/// Subscribe to every state dataref, as the firmware does on startup
async fn fake_simulator(server: std::net::SocketAddr) -> UdpSocket {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(server).await.unwrap();
    for (i, key) in STATE_DATAREFS.iter().enumerate() {
        let sub = Subscription {
            freq: 10,
            id: i as u32 + 1,
            path: format!("sim/flightmodel/{}", key),
        };
        client.send(&sub.encode()).await.unwrap();
    }
    let sentinel = Subscription {
        freq: 1,
        id: 99,
        path: format!("sim/joystick/{}", HANDSHAKE_SENTINEL),
    };
    client.send(&sentinel.encode()).await.unwrap();
    client
}

#[tokio::test]
async fn scenario_end_to_end() {
    let fc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fc_address = fc_listener.local_addr().unwrap();
    let (records_tx, mut records) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = fc_listener.accept().await.unwrap();
        serve_fc(stream, FcScript::default(), records_tx).await;
    });

    let mut config = Config::default();
    config.simulator.auto_start = false;
    config.link.address = fc_address.to_string();
    config.link.min_send_ms = 20;
    config.link.connect_timeout_s = 5;
    config.replay.auto_arm = true;
    config.replay.failsafe = FailsafeMode::Throttle(FAILSAFE_THROTTLE);

    let socket = fl2sitl::sim::bind("127.0.0.1:0").await.unwrap();
    let client = fake_simulator(socket.local_addr().unwrap()).await;

    let (meta, source) = LogSource::from_reader(Cursor::new(scenario_log().into_bytes()))
        .await
        .unwrap();
    let (_operator_tx, operator_rx) = mpsc::channel(4);

    timeout(
        Duration::from_secs(20),
        bridge::replay(&config, meta, source, socket, operator_rx),
    )
    .await
    .expect("session did not finish")
    .expect("session failed");

    // The simulator got state updates
    let mut buf = [0u8; 256];
    let n = timeout(Duration::from_secs(1), client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..5], b"RREF\0");
    assert_eq!(n, 5 + STATE_DATAREFS.len() * 8);

    let mut throttles = Vec::new();
    let mut armed_seen = false;
    let mut disarmed_after_arm = false;
    while let Ok(record) = records.try_recv() {
        match record {
            FcRecord::RawRc(channels) => throttles.push(channels[3]),
            FcRecord::Status { armed: true } => armed_seen = true,
            FcRecord::Status { armed: false } if armed_seen => disarmed_after_arm = true,
            _ => {}
        }
    }

    assert!(armed_seen, "flight controller never armed");
    assert!(disarmed_after_arm, "flight controller not disarmed at the end");

    let live = throttles.iter().position(|&t| t == 1200).expect("no live frame");
    let failsafe = throttles
        .iter()
        .position(|&t| t == FAILSAFE_THROTTLE)
        .expect("no failsafe frame");
    let recovered = throttles.iter().position(|&t| t == 1450).expect("no recovered frame");
    assert!(live < failsafe && failsafe < recovered);
    assert!(!throttles.contains(&1300), "sticks leaked through failsafe");
}

fn long_armed_log(samples: usize, step_us: u64) -> String {
    let mut log = String::from(
        "{\"type\":\"meta\",\"name\":\"long\",\"craft\":\"quad\",\"acc_1g\":4096}\n",
    );
    for i in 0..samples {
        log.push_str(&format!(
            "{{\"type\":\"sample\",\"stamp\":{},\"lat\":54.1,\"lon\":-4.7,\"alt\":20,\
             \"acc_z\":4096,\"ail\":1500,\"ele\":1500,\"rud\":1500,\"thr\":1400,\
             \"rssi\":80,\"status\":{}}}\n",
            i as u64 * step_us,
            STATUS_ARMED
        ));
    }
    log
}

#[tokio::test]
async fn quit_gives_up_on_disarm_while_log_streams() {
    let fc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fc_address = fc_listener.local_addr().unwrap();
    let (records_tx, mut records) = mpsc::unbounded_channel();
    let script = FcScript {
        hold_armed: true,
        ..FcScript::default()
    };
    tokio::spawn(async move {
        let (stream, _) = fc_listener.accept().await.unwrap();
        serve_fc(stream, script, records_tx).await;
    });

    let mut config = Config::default();
    config.simulator.auto_start = false;
    config.link.address = fc_address.to_string();
    config.link.min_send_ms = 20;
    config.link.connect_timeout_s = 5;
    config.replay.auto_arm = true;

    let socket = fl2sitl::sim::bind("127.0.0.1:0").await.unwrap();
    let _client = fake_simulator(socket.local_addr().unwrap()).await;

    // 20 s of samples every 50 ms, far longer than the disarm wait
    let log = long_armed_log(400, 50_000);
    let (meta, source) = LogSource::from_reader(Cursor::new(log.into_bytes()))
        .await
        .unwrap();
    let (operator_tx, operator_rx) = mpsc::channel(4);

    let quit = async move {
        loop {
            match records.recv().await {
                Some(FcRecord::Status { armed: true }) => break,
                Some(_) => continue,
                None => panic!("flight controller went away before arming"),
            }
        }
        let quit_at = Instant::now();
        operator_tx.send(OperatorCommand::Quit).await.unwrap();
        (quit_at, operator_tx)
    };

    let (result, (quit_at, _operator_tx)) = tokio::join!(
        timeout(
            Duration::from_secs(30),
            bridge::replay(&config, meta, source, socket, operator_rx),
        ),
        quit
    );
    let waited = quit_at.elapsed();

    result.expect("session did not finish").expect("session failed");
    assert!(waited >= DISARM_WAIT, "ended before the disarm wait: {:?}", waited);
    assert!(
        waited < DISARM_WAIT + Duration::from_secs(2),
        "session outlived the disarm wait: {:?}",
        waited
    );
}
