//! Chrome trace output.
//!
//! Load the written file in chrome://tracing or Perfetto.  Scopes on the
//! main thread land on track 0; executed actions land on their worker's
//! track.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

static TRACE: Mutex<Option<Trace>> = parking_lot::const_mutex(None);

struct Event<'a> {
    name: &'a str,
    tid: usize,
    start: Instant,
    end: Instant,
}

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_event(&mut self, event: &Event) -> std::io::Result<()> {
        write!(
            self.w,
            "{{\"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ts\": {}, \"ph\": \"X\", \"dur\": {}}}",
            event.tid,
            event.name,
            event.start.duration_since(self.start).as_micros(),
            event.end.duration_since(event.start).as_micros(),
        )
    }

    fn write(&mut self, event: &Event) {
        let result = self
            .write_event(event)
            .and_then(|_| writeln!(self.w, ","));
        if let Err(err) = result {
            log::warn!("trace write failed: {}", err);
        }
    }

    fn close(&mut self) -> std::io::Result<()> {
        let main = Event {
            name: "main",
            tid: 0,
            start: self.start,
            end: Instant::now(),
        };
        self.write_event(&main)?;
        writeln!(self.w, "]")?;
        self.w.flush()
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    *TRACE.lock() = Some(Trace::new(path)?);
    Ok(())
}

pub fn is_enabled() -> bool {
    TRACE.lock().is_some()
}

#[inline]
pub fn scope<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    if !is_enabled() {
        return f();
    }
    let start = Instant::now();
    let result = f();
    complete(name, 0, (start, Instant::now()));
    result
}

/// Records a span that has already finished, e.g. an action run on a worker.
pub fn complete(name: &str, tid: usize, span: (Instant, Instant)) {
    if let Some(t) = TRACE.lock().as_mut() {
        t.write(&Event {
            name,
            tid,
            start: span.0,
            end: span.1,
        });
    }
}

pub fn close() -> std::io::Result<()> {
    match TRACE.lock().take() {
        Some(mut t) => t.close(),
        None => Ok(()),
    }
}
