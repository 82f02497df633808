//! End-to-end tests for the readable stream engine.

#[cfg(test)]
mod support;

#[cfg(test)]
mod scenarios_e2e;

#[cfg(test)]
mod cross_realm;

#[cfg(test)]
mod tee_e2e;

#[cfg(test)]
mod external_e2e;

#[cfg(all(test, feature = "proptest"))]
mod fifo_props;

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use readable::{QueuingStrategy, ReadResult, ReadableStream, Realm, StreamState, Value};

    use crate::support::{init_logging, settle, Checked, Eager};

    #[test]
    fn synchronous_source_reads_then_repeats_done() -> Result<()> {
        init_logging();
        let realm = Realm::default();
        let source = Eager::new(vec![Value::from("a"), Value::from("b")]);
        let strategy = QueuingStrategy::count(1.0).checked()?;
        let stream = ReadableStream::new(&realm, source, strategy);
        let reader = stream.get_reader().checked()?;

        let mut results = Vec::new();
        for _ in 0..4 {
            let read = reader.read().checked()?;
            results.push(settle(&realm, read)?.map_err(|err| anyhow::anyhow!("{err:?}"))?);
        }
        assert_eq!(
            results,
            vec![
                ReadResult::chunk(Value::from("a")),
                ReadResult::chunk(Value::from("b")),
                ReadResult::done(),
                ReadResult::done(),
            ]
        );
        assert_eq!(stream.state(), StreamState::Closed);
        Ok(())
    }
}
