// Debug logging setup
// Routes tracing output to a file when --debug is passed, stderr otherwise

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::Level;

pub const LOG_FILE_PATH: &str = "/tmp/tictactoe-net-debug.log";

/// Initialize logging
///
/// # Arguments
/// * `enabled` - Whether debug logging should be enabled (controlled by --debug flag)
///
/// # Behavior
/// - If enabled=false: warnings and errors go to stderr, nothing else is recorded
/// - If enabled=true: creates/truncates the log file, writes a header, and sends
///   every DEBUG-and-above event there so stdout stays readable for the game
pub fn init(enabled: bool) -> io::Result<()> {
    if !enabled {
        // A subscriber may already be installed (tests, embedding); that's fine
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::WARN)
            .with_writer(io::stderr)
            .try_init();
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(LOG_FILE_PATH)?;

    writeln!(file, "=== tictactoe-net debug log ===")?;
    writeln!(file, "Session started: {:?}", SystemTime::now())?;
    writeln!(file, "To monitor: tail -f {}", LOG_FILE_PATH)?;
    writeln!(file, "========================================\n")?;

    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();

    Ok(())
}
