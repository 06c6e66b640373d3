//! Status and command loops for the metadata plane.
//!
//! Three loops cooperate per device: the front-end command loop answers
//! device-level settings, the channel control loop creates and mutates
//! channels, and the monitor loop watches driver liveness and exits the
//! process when the hardware dies so the supervisor can restart it.

use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kestrel_core::chan::ChannelTable;
use kestrel_core::filter::{FilterParams, SpectrumBus};
use kestrel_core::frontend::{db2voltage, Frontend};
use kestrel_core::linear::start_demod;
use kestrel_core::status::{
    apply_chan_commands, build_chan_status, build_frontend_status, parse_frontend_commands,
    FrontendCommand,
};
use kestrel_core::tlv::{self, PKT_COMMAND};

use crate::drivers::FrontendDriver;

pub type SharedDriver = Arc<Mutex<Box<dyn FrontendDriver>>>;

/// Blocking receive loop for device-level commands. Messages leading with
/// a 0 byte are our own responses; messages carrying an SSRC belong to the
/// channel loop. Every accepted command is answered with a fresh status
/// frame.
pub fn frontend_command_loop(
    fe: Arc<Frontend>,
    driver: SharedDriver,
    recv: UdpSocket,
    send: UdpSocket,
) {
    // Announce ourselves before the first command arrives
    if let Err(e) = send.send(&build_frontend_status(&fe)) {
        log::warn!("status send failed: {}", e);
    }
    let mut buf = vec![0u8; tlv::COMMAND_BUFFER_MAX];
    loop {
        let n = match recv.recv(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("command receive failed: {}", e);
                continue;
            }
        };
        if n == 0 || buf[0] != PKT_COMMAND {
            continue; // our own response traffic
        }
        let body = &buf[1..n];
        if tlv::find_ssrc(body) != 0 {
            continue; // channel-addressed
        }
        fe.commands.fetch_add(1, Ordering::Relaxed);
        let (tag, commands) = parse_frontend_commands(body);
        if tag != 0 {
            fe.command_tag.store(tag, Ordering::Relaxed);
        }
        for command in commands {
            match command {
                FrontendCommand::Calibrate(v) => {
                    fe.calibrate.store(v, Ordering::Relaxed);
                }
                FrontendCommand::RfGain(v) => {
                    fe.rf_gain.store(v, Ordering::Relaxed);
                    let atten = fe.rf_atten.load(Ordering::Relaxed);
                    fe.gain.store(db2voltage(v - atten), Ordering::Relaxed);
                }
                FrontendCommand::RfAtten(v) => {
                    fe.rf_atten.store(v, Ordering::Relaxed);
                    let gain = fe.rf_gain.load(Ordering::Relaxed);
                    fe.gain.store(db2voltage(gain - v), Ordering::Relaxed);
                }
                FrontendCommand::Frequency(f) => {
                    if fe.lock.load(Ordering::Relaxed) {
                        log::info!("tuning locked, ignoring retune to {} Hz", f);
                        continue;
                    }
                    match driver.lock().unwrap().tune(f) {
                        Ok(actual) => log::info!("retuned to {} Hz", actual),
                        Err(e) => log::warn!("retune to {} Hz failed: {}", f, e),
                    }
                }
            }
        }
        if let Err(e) = send.send(&build_frontend_status(&fe)) {
            log::warn!("status send failed: {}", e);
        }
    }
}

/// Channel command intake: an SSRC-bearing command creates the channel on
/// first reference, applies the settings, and answers with the channel's
/// status. SSRC 0 polls everything.
pub fn channel_control_loop(
    table: Arc<ChannelTable>,
    fe: Arc<Frontend>,
    bus: Arc<SpectrumBus>,
    params: FilterParams,
    recv: UdpSocket,
    send: UdpSocket,
) {
    let mut buf = vec![0u8; tlv::COMMAND_BUFFER_MAX];
    loop {
        let n = match recv.recv(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("control receive failed: {}", e);
                continue;
            }
        };
        if n == 0 || buf[0] != PKT_COMMAND {
            continue;
        }
        let body = &buf[1..n];
        let ssrc = tlv::find_ssrc(body);
        if ssrc == 0 {
            // Poll: everyone reports
            let _ = send.send(&build_frontend_status(&fe));
            for chan in table.active() {
                let _ = send.send(&build_chan_status(&chan));
            }
            continue;
        }
        let (chan, created) = match table.lookup(ssrc) {
            Some(chan) => (chan, false),
            None => match table.create(ssrc) {
                Ok(chan) => (chan, true),
                Err(e) => {
                    log::warn!("cannot create channel {:#010x}: {}", ssrc, e);
                    continue;
                }
            },
        };
        apply_chan_commands(&chan, body);
        if created {
            start_demod(&chan, &fe, &bus, params);
            log::info!(
                "channel {:#010x} created at {:.0} Hz",
                ssrc,
                chan.config().tune.freq
            );
        }
        let _ = send.send(&build_chan_status(&chan));
    }
}

/// Once-per-second liveness poll. A dead device ends the process; the
/// supervisor is expected to restart it.
pub fn monitor_loop(fe: Arc<Frontend>, driver: SharedDriver) -> ! {
    loop {
        std::thread::sleep(Duration::from_secs(1));
        let streaming = driver.lock().unwrap().is_streaming();
        if !streaming {
            log::error!(
                "front end \"{}\" is no longer streaming, exiting",
                fe.description
            );
            driver.lock().unwrap().close();
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::multicast;
    use kestrel_core::status::send_poll;
    use kestrel_core::tlv::{decode_double, Tag, TlvReader};

    /// Wire a control loop to loopback sockets and drive it like a client.
    #[test]
    fn test_channel_created_and_answers_status() {
        let fe = Arc::new(Frontend::new("loop test".into(), false, 16));
        fe.set_samprate(48_000);
        let params = FilterParams::derive(48_000, 20.0, 5).unwrap();
        let bus = SpectrumBus::new();
        let table = Arc::new(ChannelTable::new());

        // Loop's receive socket and the client's response listener
        let loop_rx = multicast::listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let loop_port = loop_rx.local_addr().unwrap().port();
        let client_rx = multicast::listen("127.0.0.1:0".parse().unwrap()).unwrap();
        client_rx
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let client_port = client_rx.local_addr().unwrap().port();
        let loop_tx =
            multicast::connect(format!("127.0.0.1:{client_port}").parse().unwrap(), 1).unwrap();

        {
            let table = Arc::clone(&table);
            let fe = Arc::clone(&fe);
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || {
                channel_control_loop(table, fe, bus, params, loop_rx, loop_tx);
            });
        }

        // Command: create SSRC 0x77 at 14.2 MHz
        let client_tx = multicast::connect(
            format!("127.0.0.1:{loop_port}").parse().unwrap(),
            1,
        )
        .unwrap();
        let mut cmd = Vec::new();
        cmd.push(PKT_COMMAND);
        tlv::encode_int32(&mut cmd, Tag::OutputSsrc, 0x77);
        tlv::encode_double(&mut cmd, Tag::RadioFrequency, 14_200_000.0);
        tlv::encode_eol(&mut cmd);
        client_tx.send(&cmd).unwrap();

        // The loop answers with the channel's status frame
        let mut buf = [0u8; 2048];
        let n = client_rx.recv(&mut buf).unwrap();
        assert_eq!(buf[0], tlv::PKT_RESPONSE);
        assert_eq!(tlv::find_ssrc(&buf[1..n]), 0x77);
        let mut freq = None;
        for (tag, value) in TlvReader::new(&buf[1..n]) {
            if tag == Tag::RadioFrequency {
                freq = Some(decode_double(value));
            }
        }
        assert_eq!(freq, Some(14_200_000.0));

        let chan = table.lookup(0x77).expect("channel exists");
        assert_eq!(chan.config().tune.freq, 14_200_000.0);

        // Poll (SSRC 0) reports the front end and the channel
        send_poll(&client_tx, 0).unwrap();
        let n1 = client_rx.recv(&mut buf).unwrap();
        assert_eq!(tlv::find_ssrc(&buf[1..n1]), 0); // frontend frame first
        let n2 = client_rx.recv(&mut buf).unwrap();
        assert_eq!(tlv::find_ssrc(&buf[1..n2]), 0x77);

        table.free(&chan);
    }
}
