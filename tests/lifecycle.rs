use log::{LevelFilter, Log, Metadata, Record};
use std::sync::Mutex;
use x86_dft::*;

/// Keeps every message, so the lifecycle messages can be checked
struct Capture(Mutex<Vec<String>>);

impl Log for Capture {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if let Ok(mut lines) = self.0.lock() {
            lines.push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture(Mutex::new(Vec::new()));

#[test]
fn init_and_teardown_report_shadow_size() {
    log::set_logger(&CAPTURE).unwrap_or_else(|e| panic!("Failed to install logger: {}", e));
    log::set_max_level(LevelFilter::Info);

    let mut config = Config::default();
    config.address_space = 1 << 16;
    let engine = Engine::init(config).unwrap_or_else(|e| panic!("Failed to initialize engine: {}", e));
    let size = engine.tagmap().shadow_size();
    assert_eq!(size, (1 << 13) + 1);
    engine.teardown();

    let lines = CAPTURE.0.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let allocated = format!("Allocated {} bytes of shadow memory", size);
    let released = format!("Released {} bytes of shadow memory", size);
    assert!(lines.iter().any(|l| l.starts_with(&allocated)), "{:?}", lines);
    assert!(lines.iter().any(|l| l.starts_with(&released)), "{:?}", lines);
}
