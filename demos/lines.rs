//! Follows a single file and prints its lines along with their end offsets.
//!
//! Usage:
//!     lines /path/to/file [offset]
//!
//! The file need not exist yet. Stop with Ctrl-C; the offset to resume from
//! is printed on exit.

use std::time::Duration;

use logagent::{EventHub, TailCursor, TailOptions};

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let path = args.next().ok_or("usage: lines <path> [offset]")?;
    let offset = match args.next() {
        Some(offset) => offset.parse::<u64>()?,
        None => 0,
    };

    let poll_interval = Duration::from_millis(250);
    let hub = EventHub::new(poll_interval)?;
    let options = TailOptions {
        offset,
        poll_interval,
    };
    let mut cursor = TailCursor::open(&hub, &path, options).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = cursor.next_line() => {
                let line = line?;
                println!("({} @{}) {}", line.source().display(), line.end_offset(), line.line());
            }
        }
    }

    println!("resume from offset {}", cursor.stop()?);
    Ok(())
}
