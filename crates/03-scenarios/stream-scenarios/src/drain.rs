use log::trace;
use readable::{DefaultReader, StreamResult, Value};

/// Everything a reader observed while draining a stream.
#[derive(Clone, Debug, Default)]
pub struct DrainReport {
    pub chunks: Vec<Value>,
    pub reads: u32,
    pub done: bool,
    pub error: Option<Value>,
    /// A read was still pending once both realms went idle.
    pub stalled: bool,
}

impl DrainReport {
    pub fn numbers(&self) -> Vec<Option<f64>> {
        self.chunks.iter().map(Value::as_number).collect()
    }
}

/// Runs the reader's realm and, when different, the stream's realm until
/// neither has work left. Returns the number of tasks executed.
pub fn pump(reader: &DefaultReader) -> usize {
    let stream_realm = reader
        .stream()
        .map(|stream| stream.realm().clone())
        .filter(|realm| !realm.same(reader.realm()));
    let mut work = 0;
    loop {
        let mut ran = reader.realm().run_until_idle();
        if let Some(realm) = &stream_realm {
            ran += realm.run_until_idle();
        }
        if ran == 0 {
            break;
        }
        work += ran;
    }
    work
}

/// Reads until the stream reports done, errors or stops making progress.
pub fn drain(reader: &DefaultReader) -> StreamResult<DrainReport> {
    let mut report = DrainReport::default();
    loop {
        let read = reader.read()?;
        report.reads += 1;
        pump(reader);
        match read.outcome() {
            None => {
                trace!("drain stalled after {} reads", report.reads);
                report.stalled = true;
                break;
            }
            Some(Ok(result)) if result.done => {
                report.done = true;
                break;
            }
            Some(Ok(result)) => report.chunks.push(result.value),
            Some(Err(error)) => {
                report.error = Some(error);
                break;
            }
        }
    }
    Ok(report)
}
