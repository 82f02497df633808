use anyhow::{Context, Result};
use readable::{Domain, ErrorName, Realm, RealmConfig, StreamError, StreamState, Value};

use crate::support::{init_logging, pushed, settle, Checked};

fn pair() -> (Realm, Realm) {
    (
        Realm::new(RealmConfig::new("producer")),
        Realm::new(RealmConfig::new("consumer")),
    )
}

#[test]
fn chunks_arrive_wrapped_with_stable_identity() -> Result<()> {
    init_logging();
    let (producer, consumer) = pair();
    let (source, stream) = pushed(&producer);
    let reader = stream.get_reader_in(&consumer).checked()?;
    let controller = source.controller()?;

    let chunk = producer.list(vec![Value::from(1), Value::from("one")]);
    controller.enqueue(chunk.clone()).checked()?;
    controller.enqueue(chunk.clone()).checked()?;
    controller.enqueue(Value::from(7)).checked()?;

    let first = settle(&consumer, reader.read().checked()?)?.map_err(|e| anyhow::anyhow!("{e:?}"))?;
    let second = settle(&consumer, reader.read().checked()?)?.map_err(|e| anyhow::anyhow!("{e:?}"))?;
    let third = settle(&consumer, reader.read().checked()?)?.map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let home = first.value.home().context("wrapped chunk has a home")?;
    assert!(home.same(consumer.domain()));
    assert_ne!(first.value, chunk, "consumer never sees the producer's object");
    assert_eq!(first.value, second.value, "one wrapper per destination");
    let target = first.value.as_object().context("object chunk")?.target();
    assert!(target.same(chunk.as_object().context("object chunk")?));
    assert_eq!(third.value, Value::from(7), "primitives cross unchanged");
    assert!(source.pulls.get() >= 1, "started source is pulled to its mark");
    Ok(())
}

#[test]
fn stored_error_is_adapted_for_the_consumer() -> Result<()> {
    init_logging();
    let (producer, consumer) = pair();
    let (source, stream) = pushed(&producer);
    let reader = stream.get_reader_in(&consumer).checked()?;
    let pending = reader.read().checked()?;

    let error = producer.error(ErrorName::TypeError, "bad frame");
    source.controller()?.error(error.clone());

    let rejected = settle(&consumer, pending)?.err().context("read must reject")?;
    assert_eq!(rejected.error_name(), Some(ErrorName::TypeError));
    assert_eq!(rejected.error_message(), Some("bad frame"));
    assert!(rejected.home().context("error home")?.same(consumer.domain()));

    let closed = settle(&consumer, reader.closed())?.err().context("closed must reject")?;
    assert_eq!(closed, rejected, "same wrapper for read and closed");
    assert_eq!(stream.stored_error(), Some(error));
    Ok(())
}

#[test]
fn cancel_reason_reaches_the_source_in_its_own_realm() -> Result<()> {
    init_logging();
    let (producer, consumer) = pair();
    let (source, stream) = pushed(&producer);
    let reader = stream.get_reader_in(&consumer).checked()?;

    let reason = consumer.error(ErrorName::Error, "consumer quit");
    let canceled = reader.cancel(reason.clone()).checked()?;
    producer.run_until_idle();
    assert_eq!(settle(&consumer, canceled)?, Ok(()));

    let reasons = source.reasons.borrow();
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].home().context("reason home")?.same(producer.domain()));
    assert_eq!(reasons[0].error_message(), Some("consumer quit"));
    assert_eq!(stream.state(), StreamState::Closed);
    Ok(())
}

#[test]
fn shutdown_leaves_cross_realm_reads_pending() -> Result<()> {
    init_logging();
    let (producer, consumer) = pair();
    let (source, stream) = pushed(&producer);
    let reader = stream.get_reader_in(&consumer).checked()?;
    let pending = reader.read().checked()?;
    producer.run_until_idle();

    consumer.shutdown();
    source
        .controller()?
        .enqueue(producer.list(vec![Value::from("late")]))
        .checked()?;
    producer.run_until_idle();
    consumer.run_until_idle();
    assert!(pending.is_pending(), "no settlement may cross into a dead realm");
    Ok(())
}

#[test]
fn foreign_error_is_stored_in_the_stream_realm() -> Result<()> {
    init_logging();
    let realm = Realm::new(RealmConfig::new("producer"));
    let elsewhere = Domain::new("elsewhere");
    let (source, stream) = pushed(&realm);
    let reader = stream.get_reader().checked()?;
    let pending = reader.read().checked()?;

    let error = Value::error(&elsewhere, ErrorName::RangeError, "out of band");
    source.controller()?.error(error.clone());
    assert_eq!(stream.state(), StreamState::Errored);

    let stored = stream.stored_error().context("errored stream keeps its error")?;
    assert!(stored.home().context("error home")?.same(realm.domain()));
    assert_ne!(stored, error, "the foreign object itself is never stored");
    assert_eq!(stored.error_message(), Some("out of band"));
    let rejected = settle(&realm, pending)?.err().context("read must reject")?;
    assert_eq!(rejected, stored);
    Ok(())
}

#[test]
fn foreign_chunk_is_adapted_on_enqueue() -> Result<()> {
    init_logging();
    let realm = Realm::new(RealmConfig::new("producer"));
    let elsewhere = Domain::new("elsewhere");
    let (source, stream) = pushed(&realm);
    let controller = source.controller()?;

    let chunk = Value::list(&elsewhere, vec![Value::from("payload")]);
    controller.enqueue(chunk.clone()).checked()?;
    let reader = stream.get_reader().checked()?;
    let read = settle(&realm, reader.read().checked()?)?.map_err(|e| anyhow::anyhow!("{e:?}"))?;
    assert!(read.value.home().context("chunk home")?.same(realm.domain()));
    assert_ne!(read.value, chunk);
    let target = read.value.as_object().context("object chunk")?.target();
    assert!(target.same(chunk.as_object().context("object chunk")?));

    elsewhere.shutdown();
    assert!(matches!(controller.enqueue(chunk.clone()), Err(StreamError::Boundary(_))));
    controller.error(Value::error(&elsewhere, ErrorName::Error, "gone"));
    assert_eq!(stream.state(), StreamState::Readable, "an error from a dead realm is dropped");
    Ok(())
}
