use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::{Context, Result};
use microtask::TaskQueue;
use readable::{
    ByteController, ByteStreamOptions, ControllerKind, ExternalSource, ExternalSourceHost,
    HookResult, ReadableStream, Realm, RealmConfig, StreamState, Value,
};
use stream_scenarios::drain;

use crate::support::{init_logging, settle, Checked};

/// Serves bytes from a per-source buffer, a few at a time, on a later task.
#[derive(Default)]
struct SocketHost {
    tasks: RefCell<Option<TaskQueue>>,
    requests: Cell<usize>,
    closed: Cell<bool>,
    canceled: RefCell<Option<Value>>,
    finalized: RefCell<Vec<u32>>,
}

const SLICE: usize = 4;

fn buffer_of(source: &ExternalSource) -> Option<&RefCell<Vec<u8>>> {
    source.downcast_ref::<RefCell<Vec<u8>>>()
}

impl ExternalSourceHost for SocketHost {
    fn request_data(
        &self,
        controller: &ByteController,
        source: &ExternalSource,
        _flags: u32,
        _desired_size: f64,
    ) {
        self.requests.set(self.requests.get() + 1);
        let Some(tasks) = self.tasks.borrow().clone() else {
            return;
        };
        let controller = controller.clone();
        let source = Rc::clone(source);
        tasks.enqueue(move || {
            let Some(buffer) = buffer_of(&source) else {
                return;
            };
            let pending = buffer.borrow().len();
            let outcome = if pending == 0 {
                controller.close()
            } else {
                controller.update_data_available(pending.min(SLICE))
            };
            if let Err(err) = outcome {
                log::warn!("socket host update failed: {err}");
            }
        });
    }

    fn write_into_buffer(
        &self,
        _controller: &ByteController,
        source: &ExternalSource,
        _flags: u32,
        out: &mut [u8],
    ) -> usize {
        let Some(buffer) = buffer_of(source) else {
            return 0;
        };
        let mut data = buffer.borrow_mut();
        let n = out.len().min(data.len());
        out[..n].copy_from_slice(&data[..n]);
        data.drain(..n);
        n
    }

    fn cancel(
        &self,
        _controller: &ByteController,
        _source: &ExternalSource,
        _flags: u32,
        reason: Value,
    ) -> HookResult {
        *self.canceled.borrow_mut() = Some(reason);
        Ok(None)
    }

    fn closed_notify(&self, _controller: &ByteController, _source: &ExternalSource, _flags: u32) {
        self.closed.set(true);
    }

    fn finalize(&self, _source: &ExternalSource, flags: u32) {
        self.finalized.borrow_mut().push(flags);
    }
}

fn socket_realm() -> (Realm, Rc<SocketHost>) {
    let host = Rc::new(SocketHost::default());
    let realm = Realm::new(RealmConfig::new("socket").with_external_host(host.clone()));
    *host.tasks.borrow_mut() = Some(realm.tasks().clone());
    (realm, host)
}

fn socket(payload: &[u8]) -> ExternalSource {
    Rc::new(RefCell::new(payload.to_vec()))
}

#[test]
fn external_stream_streams_the_whole_payload() -> Result<()> {
    init_logging();
    let (realm, host) = socket_realm();
    let payload = b"the quick brown fox";
    let stream =
        ReadableStream::new_external(&realm, socket(payload), 0x2, ByteStreamOptions::default())
            .checked()?;
    assert_eq!(stream.controller_kind(), Some(ControllerKind::External));

    let reader = stream.get_reader().checked()?;
    let report = drain(&reader).checked()?;
    assert!(report.done, "stream closes once the host runs dry");

    let mut received = Vec::new();
    for chunk in &report.chunks {
        let bytes = chunk.as_bytes().context("byte chunk")?;
        assert!(bytes.len() <= SLICE);
        received.extend_from_slice(bytes);
    }
    assert_eq!(received, payload.to_vec());
    assert!(host.requests.get() >= payload.len() / SLICE);
    assert!(host.closed.get());
    assert_eq!(stream.state(), StreamState::Closed);
    Ok(())
}

#[test]
fn canceling_an_external_stream_reaches_the_host() -> Result<()> {
    init_logging();
    let (realm, host) = socket_realm();
    let stream =
        ReadableStream::new_external(&realm, socket(b"abc"), 0, ByteStreamOptions::default())
            .checked()?;
    let reader = stream.get_reader().checked()?;
    let canceled = reader.cancel(Value::from("hang up")).checked()?;
    assert_eq!(settle(&realm, canceled)?, Ok(()));
    assert_eq!(host.canceled.borrow().clone(), Some(Value::from("hang up")));
    assert!(settle(&realm, reader.read().checked()?)?.map_err(|e| anyhow::anyhow!("{e:?}"))?.done);
    Ok(())
}

#[test]
fn dropping_the_last_handle_finalizes_the_source() -> Result<()> {
    init_logging();
    let (realm, host) = socket_realm();
    let stream =
        ReadableStream::new_external(&realm, socket(b""), 0x9, ByteStreamOptions::default())
            .checked()?;
    let source = stream.lock_external_source().checked()?;
    assert!(buffer_of(&source).is_some());
    stream.release_external_source().checked()?;
    drop(stream);
    realm.run_until_idle();
    assert_eq!(*host.finalized.borrow(), vec![0x9]);
    assert_eq!(realm.live_streams(), 0);
    Ok(())
}
