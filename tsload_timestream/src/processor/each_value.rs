use std::sync::Arc;

use indexmap::IndexMap;
use tsload_targets::{BatchFailure, ProcessedBatch};

use super::{EncodedRequest, ProcessorContext, dimensions, measure, time_attributes};
use crate::{
    batch::TimestreamBatch,
    write_service::{MAX_RECORDS_PER_REQUEST, Record},
};

/// Writes every field value as a self-contained record with its own
/// dimensions and time.
///
/// Records are grouped by table, in the order tables first appear in the
/// batch, and packed into requests of at most
/// [`MAX_RECORDS_PER_REQUEST`] records.
#[derive(Debug)]
pub struct EachValueARecordProcessor {
    context: Arc<ProcessorContext>,
}

impl EachValueARecordProcessor {
    pub fn new(context: Arc<ProcessorContext>) -> Self {
        Self { context }
    }

    pub async fn process_batch(
        &self,
        batch: TimestreamBatch,
        do_load: bool,
    ) -> Result<ProcessedBatch, BatchFailure> {
        let requests = self.encode(&batch);
        self.context.flush(batch, requests, do_load).await
    }

    fn encode(&self, batch: &TimestreamBatch) -> Vec<EncodedRequest> {
        let headers = self.context.headers();
        let mut by_table: IndexMap<&str, Vec<Record>> = IndexMap::new();

        for point in batch.points() {
            if point.fields().is_empty() {
                continue;
            }

            let dimensions = dimensions(headers, point);
            let (time, time_unit) = time_attributes(point);
            let records = by_table.entry(point.table().as_ref()).or_default();

            for (key, value) in point.fields() {
                records.push(Record {
                    dimensions: dimensions.clone(),
                    time: time.clone(),
                    time_unit,
                    ..measure(key, value)
                });
            }
        }

        by_table
            .into_iter()
            .flat_map(|(table, records)| {
                records
                    .chunks(MAX_RECORDS_PER_REQUEST)
                    .map(|chunk| EncodedRequest {
                        request: self.context.request(table, None, chunk.to_vec()),
                        rows: 0,
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
