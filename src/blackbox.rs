//! Black-box flight recorder for post-mortem debugging
//!
//! A `tracing` layer that keeps the most recent DEBUG events in a bounded
//! ring, independent of the console filter, so a quiet production run
//! still carries the fine-grained trail. The ring is dumped to stderr on
//! shutdown.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Ring capacity in entries
pub const BLACK_BOX_SIZE: usize = 5000;

static RING: Mutex<VecDeque<String>> = Mutex::new(VecDeque::new());

/// Subscriber layer feeding the ring
pub struct BlackBoxLayer;

impl<S: Subscriber> Layer<S> for BlackBoxLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::DEBUG {
            return;
        }

        let mut line = String::new();
        let mut visitor = LineVisitor { line: &mut line };
        event.record(&mut visitor);

        let mut ring = RING.lock().unwrap();
        if ring.len() >= BLACK_BOX_SIZE {
            ring.pop_front();
        }
        ring.push_back(line);
    }
}

struct LineVisitor<'a> {
    line: &'a mut String,
}

impl Visit for LineVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.line, "{value:?} ");
        } else {
            let _ = write!(self.line, "{}={:?} ", field.name(), value);
        }
    }
}

/// Entries currently held
pub fn len() -> usize {
    RING.lock().unwrap().len()
}

/// Dump the ring to stderr, oldest first
pub fn dump() {
    let ring = RING.lock().unwrap();
    eprintln!("=== BLACK BOX DUMP ({} entries) ===", ring.len());
    for line in ring.iter() {
        eprintln!("{line}");
    }
    eprintln!("=== END BLACK BOX ===");
}
