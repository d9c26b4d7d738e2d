use std::{
    io::{BufRead, Write},
    sync::{Arc, Mutex},
};

use honda_srs_diag::{
    channel::KLineSettings,
    dtc::DtcTable,
    hardware::{Hardware, HardwareScanner, passthru::{PassthruDevice, PassthruScanner}},
    helpers::hex_string,
    honda::{SrsSession, SrsSessionOptions},
};

extern crate honda_srs_diag;

fn ask_clear_crash_data(crash_data: &[u8]) -> bool {
    print!(
        "ECU holds crash data ({}). Clear it? [y/N] ",
        hex_string(crash_data)
    );
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim(), "y" | "Y" | "yes")
}

#[cfg(feature = "serde")]
fn load_table() -> DtcTable {
    match std::env::var("SRS_DTC_TABLE") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path).unwrap();
            let table = DtcTable::from_json_str(&json).unwrap();
            println!("Loaded {} DTC descriptions from {path}", table.len());
            table
        }
        Err(_) => DtcTable::new(),
    }
}

#[cfg(not(feature = "serde"))]
fn load_table() -> DtcTable {
    DtcTable::new()
}

fn main() {
    env_logger::builder()
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();

    let scanner = PassthruScanner::new();
    let devices = scanner.list_devices();
    for (idx, d) in devices.iter().enumerate() {
        println!("{idx}: {} ({:?}), K-Line: {}", d.name, d.vendor, d.capabilities.kline);
    }
    let dev = match std::env::args().nth(1) {
        Some(name) => scanner.open_device_by_name(&name).unwrap(),
        None => scanner.open_device_by_index(0).unwrap(),
    };
    println!("Driver: {:?}", dev.get_version());
    let dev = Arc::new(Mutex::new(dev));
    println!(
        "Battery voltage: {:?}",
        dev.lock().unwrap().read_battery_voltage()
    );

    let channel = PassthruDevice::create_kline_channel(dev.clone(), KLineSettings::default()).unwrap();
    let mut session = SrsSession::new(channel, SrsSessionOptions::default());
    match session.run(&load_table(), &mut ask_clear_crash_data) {
        Ok(report) => println!("{report}"),
        Err(e) => println!("Diagnostic session failed: {e}"),
    }
}
