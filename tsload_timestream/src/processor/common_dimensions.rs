use std::sync::Arc;

use tsload_targets::{BatchFailure, ProcessedBatch};

use super::{EncodedRequest, ProcessorContext, dimensions, measure, time_attributes};
use crate::{
    batch::TimestreamBatch,
    write_service::{MAX_RECORDS_PER_REQUEST, Record},
};

/// Writes each point as one request: dimensions and time go into the
/// request's common attributes, each field becomes a record carrying only its
/// measure.
///
/// A point with more fields than a request takes is split over several
/// requests sharing the same common attributes.
#[derive(Debug)]
pub struct CommonDimensionsProcessor {
    context: Arc<ProcessorContext>,
}

impl CommonDimensionsProcessor {
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
        let mut requests = Vec::with_capacity(batch.points().len());

        for point in batch.points() {
            if point.fields().is_empty() {
                continue;
            }

            let (time, time_unit) = time_attributes(point);
            let common = Record {
                dimensions: dimensions(headers, point),
                time,
                time_unit,
                ..Default::default()
            };

            let records = point
                .fields()
                .iter()
                .map(|(key, value)| measure(key, value))
                .collect::<Vec<_>>();

            let chunks = records.len().div_ceil(MAX_RECORDS_PER_REQUEST);
            for (i, chunk) in records.chunks(MAX_RECORDS_PER_REQUEST).enumerate() {
                requests.push(EncodedRequest {
                    request: self.context.request(
                        point.table(),
                        Some(common.clone()),
                        chunk.to_vec(),
                    ),
                    rows: u64::from(i + 1 == chunks),
                });
            }
        }

        requests
    }
}
