use std::{
    io::{BufRead, Write},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use honda_srs_diag::{
    channel::KLineSettings,
    dtc::DtcTable,
    hardware::{Hardware, HardwareScanner, serial::{SerialKLineDevice, SerialKLineScanner}},
    helpers::hex_string,
    honda::{SrsSession, SrsSessionOptions},
};

extern crate honda_srs_diag;

fn main() {
    env_logger::builder()
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();

    let dev = match std::env::args().nth(1) {
        Some(path) => SerialKLineDevice::from_path(&path),
        None => {
            let scanner = SerialKLineScanner::new();
            for d in scanner.list_devices() {
                println!("Found port {} ({:?})", d.name, d.vendor);
            }
            scanner.open_device_by_index(0).unwrap()
        }
    };

    // Dual wire interfaces do not read back their own transmission
    let settings = KLineSettings {
        echo_cancel: std::env::var("SRS_NO_ECHO").is_err(),
        ..Default::default()
    };
    let channel = SerialKLineDevice::create_kline_channel(Arc::new(Mutex::new(dev)), settings).unwrap();

    let cancel = Arc::new(AtomicBool::new(false));
    let mut session = SrsSession::new(channel, SrsSessionOptions::default()).with_cancel_flag(cancel.clone());

    let mut decider = |crash_data: &[u8]| {
        print!("ECU holds crash data ({}). Clear it? [y/N/q] ", hex_string(crash_data));
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
        match line.trim() {
            "y" | "Y" => true,
            "q" | "Q" => {
                // Stop before the DTC clear step
                cancel.store(true, Ordering::Relaxed);
                false
            }
            _ => false,
        }
    };

    match session.run(&DtcTable::new(), &mut decider) {
        Ok(report) => println!("{report}"),
        Err(e) => println!("Diagnostic session failed: {e}"),
    }
}
