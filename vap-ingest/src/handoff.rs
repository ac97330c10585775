//! Bounded worker -> spool hand-off
//!
//! Workers can hand normalized batches to a single coordinator-side consumer
//! that appends them into consolidated per-table shards. The channel is
//! bounded; a worker whose send does not complete within the timeout gets
//! its batch back and degrades to writing its own shard file instead of
//! blocking. The destination database stays single-writer either way: the
//! consumer only produces shard files for the merge engine.

use crate::shard::ShardWriter;
use crate::types::{ErrorRecord, ErrorStage, SheetRows, ShardDescriptor, TableSchema};
use crossbeam_channel::{bounded, Sender, SendTimeoutError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

/// One normalized batch offered to the spool consumer.
#[derive(Debug)]
pub struct HandoffBatch {
    pub target_table: String,
    /// Shard-name prefix for the destination family
    pub prefix: String,
    pub source_file: String,
    pub source_sheet: String,
    pub schema: TableSchema,
    pub rows: SheetRows,
}

/// Cloneable sending side handed to each worker.
#[derive(Debug, Clone)]
pub struct HandoffSender {
    tx: Sender<HandoffBatch>,
    timeout: Duration,
}

impl HandoffSender {
    /// Offer a batch to the consumer. On timeout or a gone consumer the
    /// batch is returned so the caller can spill it to its own shard.
    pub fn offer(&self, batch: HandoffBatch) -> std::result::Result<(), HandoffBatch> {
        match self.tx.send_timeout(batch, self.timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(batch)) => {
                tracing::debug!(
                    table = %batch.target_table,
                    "Hand-off timed out, falling back to worker shard"
                );
                Err(batch)
            }
            Err(SendTimeoutError::Disconnected(batch)) => Err(batch),
        }
    }
}

/// Coordinator-side consumer spooling handed-off batches to shards.
pub struct SpoolConsumer {
    sender: Sender<HandoffBatch>,
    timeout: Duration,
    handle: JoinHandle<(Vec<ShardDescriptor>, Vec<ErrorRecord>)>,
}

impl SpoolConsumer {
    /// Start the consumer thread with a bounded channel.
    pub fn start(spool_dir: PathBuf, capacity: usize, timeout_ms: u64) -> Self {
        let (tx, rx) = bounded::<HandoffBatch>(capacity.max(1));
        let handle = std::thread::spawn(move || {
            let mut writers: HashMap<String, ShardWriter> = HashMap::new();
            let mut errors = Vec::new();

            for batch in rx {
                let writer = match writers.entry(batch.target_table.clone()) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(e) => {
                        match ShardWriter::create(
                            &spool_dir,
                            &batch.prefix,
                            &batch.target_table,
                            "spool",
                            &batch.target_table,
                            &batch.schema,
                        ) {
                            Ok(writer) => e.insert(writer),
                            Err(err) => {
                                errors.push(ErrorRecord::new(
                                    &batch.source_file,
                                    &batch.source_sheet,
                                    ErrorStage::WriteShard,
                                    "SpoolCreate",
                                    err.to_string(),
                                ));
                                continue;
                            }
                        }
                    }
                };
                if let Err(err) = writer.append_chunk(&batch.rows) {
                    errors.push(ErrorRecord::new(
                        &batch.source_file,
                        &batch.source_sheet,
                        ErrorStage::WriteShard,
                        "SpoolAppend",
                        err.to_string(),
                    ));
                }
            }

            let mut descriptors = Vec::new();
            for (_, writer) in writers {
                match writer.finish() {
                    Ok(descriptor) => descriptors.push(descriptor),
                    Err(err) => errors.push(ErrorRecord::new(
                        "spool",
                        "",
                        ErrorStage::WriteShard,
                        "SpoolFinish",
                        err.to_string(),
                    )),
                }
            }
            (descriptors, errors)
        });

        Self {
            sender: tx,
            timeout: Duration::from_millis(timeout_ms),
            handle,
        }
    }

    /// Sender handle for one worker.
    pub fn sender(&self) -> HandoffSender {
        HandoffSender {
            tx: self.sender.clone(),
            timeout: self.timeout,
        }
    }

    /// Close the channel and collect the consolidated shard descriptors.
    pub fn finish(self) -> (Vec<ShardDescriptor>, Vec<ErrorRecord>) {
        drop(self.sender);
        self.handle
            .join()
            .unwrap_or_else(|_| (Vec::new(), Vec::new()))
    }
}
