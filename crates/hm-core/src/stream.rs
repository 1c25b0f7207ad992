//! Value stream: lazy datapoint rows from the `<Values>` section.
//!
//! Each `<ValueData ParameterID="...">` block is resolved against the
//! extracted parameter table once; its `<ParameterValue>` entries are then
//! normalized and encoded one at a time. The stream owns the document cursor
//! and is exhausted after a single pass.

use std::io::BufRead;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use hm_common::{parse_timestamp, DataRow, InstrumentId, ParamId, ParameterTable, RowError, ValueType};
use hm_config::RowErrorPolicy;

use crate::document::{DocumentCursor, DocumentError, Element, Node};

/// A failure that ends the stream.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// A row-level failure under the strict policy.
    #[error("row rejected (param {param_id}, timestamp '{raw_timestamp}', value '{raw_value}'): {source}")]
    Row {
        param_id: ParamId,
        raw_timestamp: String,
        raw_value: String,
        #[source]
        source: RowError,
    },
}

/// Counters kept while streaming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub rows_yielded: u64,
    pub rows_dropped: u64,
    /// `<ValueData>` blocks read for known parameters.
    pub blocks_read: u64,
    /// `<ValueData>` blocks skipped for unknown parameters.
    pub blocks_skipped: u64,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    param_id: ParamId,
    value_type: ValueType,
}

/// Iterator of datapoint rows.
pub struct ValueStream<'p, R> {
    cursor: DocumentCursor<R>,
    parameters: &'p ParameterTable,
    instrument_id: InstrumentId,
    policy: RowErrorPolicy,
    block: Option<Block>,
    stats: StreamStats,
    done: bool,
}

impl<'p, R: BufRead> ValueStream<'p, R> {
    pub fn new(
        cursor: DocumentCursor<R>,
        parameters: &'p ParameterTable,
        instrument_id: InstrumentId,
        policy: RowErrorPolicy,
    ) -> Self {
        Self {
            cursor,
            parameters,
            instrument_id,
            policy,
            block: None,
            stats: StreamStats::default(),
            done: false,
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    fn advance(&mut self) -> Result<Option<DataRow>, StreamError> {
        loop {
            let node = self.cursor.next_node()?;
            let Some(block) = self.block else {
                match node {
                    Node::Start(el) if el.is("Values") => {
                        info!(
                            start = el.attr("Start").unwrap_or_default(),
                            end = el.attr("End").unwrap_or_default(),
                            "parsing values"
                        );
                    }
                    Node::Start(el) if el.is("ValueData") => self.open_block(&el)?,
                    Node::Eof => return Ok(None),
                    _ => {}
                }
                continue;
            };

            match node {
                Node::Start(el) if el.is("ParameterValue") => {
                    if let Some(row) = self.read_value(block, &el)? {
                        return Ok(Some(row));
                    }
                }
                Node::Start(el) if el.is("ParameterValues") => {}
                Node::Start(el) => self.cursor.skip_element(&el)?,
                Node::End(name) if name == "ValueData" => self.block = None,
                Node::End(_) | Node::Text(_) => {}
                Node::Eof => return Err(DocumentError::UnexpectedEof("ValueData".to_string()).into()),
            }
        }
    }

    fn open_block(&mut self, el: &Element) -> Result<(), StreamError> {
        let raw_id = el.attr("ParameterID").unwrap_or_default();
        let known = ParamId::parse(raw_id).and_then(|id| self.parameters.get(&id));
        match known {
            Some(record) => {
                self.block = Some(Block {
                    param_id: record.param_id,
                    value_type: record.value_type,
                });
                self.stats.blocks_read += 1;
            }
            None => {
                error!(param_id = raw_id, "parameter not found, skipping value block");
                self.cursor.skip_element(el)?;
                self.stats.blocks_skipped += 1;
            }
        }
        Ok(())
    }

    /// Read one `<ParameterValue>`. Returns `None` when the row was dropped.
    fn read_value(&mut self, block: Block, el: &Element) -> Result<Option<DataRow>, StreamError> {
        let raw_timestamp = el.attr("Timestamp").unwrap_or_default().to_string();
        let mut raw_value: Option<String> = None;
        loop {
            match self.cursor.next_node()? {
                Node::Start(child) if child.is("Value") && raw_value.is_none() => {
                    raw_value = Some(self.cursor.read_text(&child)?);
                }
                Node::Start(child) => self.cursor.skip_element(&child)?,
                Node::Text(_) => {}
                Node::End(_) => break,
                Node::Eof => {
                    return Err(DocumentError::UnexpectedEof("ParameterValue".to_string()).into())
                }
            }
        }

        match self.build_row(block, &raw_timestamp, raw_value.as_deref()) {
            Ok(row) => {
                self.stats.rows_yielded += 1;
                Ok(Some(row))
            }
            Err(source) => {
                let raw_value = raw_value.unwrap_or_default();
                match self.policy {
                    RowErrorPolicy::Skip => {
                        error!(
                            param_id = %block.param_id,
                            raw_timestamp = %raw_timestamp,
                            raw_value = %raw_value,
                            error = %source,
                            "dropping datapoint"
                        );
                        self.stats.rows_dropped += 1;
                        Ok(None)
                    }
                    RowErrorPolicy::Fail => Err(StreamError::Row {
                        param_id: block.param_id,
                        raw_timestamp,
                        raw_value,
                        source,
                    }),
                }
            }
        }
    }

    fn build_row(
        &self,
        block: Block,
        raw_timestamp: &str,
        raw_value: Option<&str>,
    ) -> Result<DataRow, RowError> {
        let time = parse_timestamp(raw_timestamp)?;
        let value = block.value_type.encode(block.param_id, raw_value)?;
        Ok(DataRow {
            time,
            instrument_id: self.instrument_id,
            param_id: block.param_id,
            value,
        })
    }
}

impl<R: BufRead> Iterator for ValueStream<'_, R> {
    type Item = Result<DataRow, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
