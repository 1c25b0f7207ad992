//! Metadata resolver: instrument, enumeration and parameter upserts.
//!
//! Every write is insert-if-absent, so running the resolver twice with the
//! same input leaves the store unchanged. Store errors other than the
//! ignored conflicts propagate unchanged; the pipeline treats them as fatal.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use hm_common::{
    EnumRef, EnumerationTable, InstrumentId, InstrumentIdentity, InstrumentRef, ParameterTable,
};
use hm_config::EnumStrategy;
use hm_store::{EnumValueRow, ParameterRow, SequentialEnumRow, StoreError, StoreGateway};

/// Enumeration name → identifier used for parameter linkage.
pub type EnumRefs = HashMap<String, EnumRef>;

/// Outcome of a full metadata pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedMetadata {
    pub instrument: InstrumentRef,
    #[serde(skip)]
    pub enum_refs: EnumRefs,
    pub enumerations: usize,
    pub parameters: usize,
    /// Parameter rows that did not exist before this pass.
    pub parameters_inserted: u64,
}

/// Writes extracted metadata through a [`StoreGateway`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataResolver {
    strategy: EnumStrategy,
}

impl MetadataResolver {
    pub fn new(strategy: EnumStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> EnumStrategy {
        self.strategy
    }

    /// Instrument, then enumerations, then parameters.
    pub fn resolve<G: StoreGateway + ?Sized>(
        &self,
        gateway: &mut G,
        identity: &InstrumentIdentity,
        enumerations: &EnumerationTable,
        parameters: &ParameterTable,
    ) -> Result<ResolvedMetadata, StoreError> {
        let instrument = self.upsert_instrument(gateway, identity)?;
        let enum_refs = self.upsert_enumerations(gateway, instrument.id, enumerations)?;
        let parameters_inserted =
            self.upsert_parameters(gateway, instrument.id, parameters, &enum_refs)?;
        Ok(ResolvedMetadata {
            instrument,
            enum_refs,
            enumerations: enumerations.len(),
            parameters: parameters.len(),
            parameters_inserted,
        })
    }

    pub fn upsert_instrument<G: StoreGateway + ?Sized>(
        &self,
        gateway: &mut G,
        identity: &InstrumentIdentity,
    ) -> Result<InstrumentRef, StoreError> {
        let instrument = gateway.upsert_instrument(identity)?;
        info!(
            instrument = %instrument.name,
            instrument_id = %instrument.id,
            serial = identity.serial,
            "instrument upserted"
        );
        Ok(instrument)
    }

    /// Store every enumeration and its members; returns the identifier of
    /// each enumeration under the configured strategy.
    pub fn upsert_enumerations<G: StoreGateway + ?Sized>(
        &self,
        gateway: &mut G,
        instrument_id: InstrumentId,
        enumerations: &EnumerationTable,
    ) -> Result<EnumRefs, StoreError> {
        if enumerations.is_empty() {
            return Ok(EnumRefs::new());
        }
        let (refs, inserted) = match self.strategy {
            EnumStrategy::NaturalKey => natural_key(gateway, instrument_id, enumerations)?,
            EnumStrategy::Sequential => sequential(gateway, instrument_id, enumerations)?,
        };
        info!(
            strategy = %self.strategy,
            enumerations = enumerations.len(),
            members = enumerations.member_count(),
            inserted,
            "enumerations upserted"
        );
        Ok(refs)
    }

    /// Batch-insert all parameters, linking each to its resolved enumeration.
    pub fn upsert_parameters<G: StoreGateway + ?Sized>(
        &self,
        gateway: &mut G,
        instrument_id: InstrumentId,
        parameters: &ParameterTable,
        enum_refs: &EnumRefs,
    ) -> Result<u64, StoreError> {
        let rows: Vec<ParameterRow<'_>> = parameters
            .values()
            .map(|record| {
                let enum_ref = record.enum_name.as_deref().and_then(|name| {
                    let found = enum_refs.get(name).copied();
                    if found.is_none() {
                        warn!(
                            param_id = %record.param_id,
                            enumeration = name,
                            "parameter references an undefined enumeration"
                        );
                    }
                    found
                });
                ParameterRow { record, enum_ref }
            })
            .collect();

        let inserted = if rows.is_empty() {
            0
        } else {
            gateway.insert_parameters(instrument_id, &rows)?
        };
        info!(parameters = rows.len(), inserted, "parameters upserted");
        Ok(inserted)
    }
}

fn natural_key<G: StoreGateway + ?Sized>(
    gateway: &mut G,
    instrument_id: InstrumentId,
    enumerations: &EnumerationTable,
) -> Result<(EnumRefs, u64), StoreError> {
    let names: Vec<&str> = enumerations.names().collect();
    let ids = gateway.upsert_enum_types(instrument_id, &names)?;

    let mut rows = Vec::with_capacity(enumerations.member_count());
    for enumeration in enumerations.iter() {
        let enum_id = ids.get(&enumeration.name).copied().ok_or_else(|| {
            StoreError::Constraint(format!(
                "no enum_types id returned for '{}'",
                enumeration.name
            ))
        })?;
        rows.extend(enumeration.members.iter().map(|m| EnumValueRow {
            enum_id,
            member_name: m.name.clone(),
            value: m.value,
        }));
    }
    let inserted = if rows.is_empty() {
        0
    } else {
        gateway.insert_enum_values(&rows)?
    };

    let refs = ids.into_iter().map(|(name, id)| (name, EnumRef(id))).collect();
    Ok((refs, inserted))
}

/// Names already numbered on this instrument keep their number; new names
/// continue from the current maximum in document order.
///
/// An enumeration without members is numbered but stores no row, so a later
/// run may hand the same number to a different enumeration.
fn sequential<G: StoreGateway + ?Sized>(
    gateway: &mut G,
    instrument_id: InstrumentId,
    enumerations: &EnumerationTable,
) -> Result<(EnumRefs, u64), StoreError> {
    let sequence = gateway.enum_sequence(instrument_id)?;
    debug!(assigned = sequence.assigned.len(), max = sequence.max, "enumeration sequence");

    let mut next = sequence.max;
    let mut refs = EnumRefs::with_capacity(enumerations.len());
    let mut rows = Vec::with_capacity(enumerations.member_count());
    for enumeration in enumerations.iter() {
        let enum_id = match sequence.assigned.get(&enumeration.name) {
            Some(&id) => id,
            None => {
                next += 1;
                next
            }
        };
        refs.insert(enumeration.name.clone(), EnumRef(enum_id));
        rows.extend(enumeration.members.iter().map(|m| SequentialEnumRow {
            enum_id,
            enum_name: enumeration.name.clone(),
            member_name: m.name.clone(),
            value: m.value,
        }));
    }
    let inserted = if rows.is_empty() {
        0
    } else {
        gateway.insert_sequential_enums(instrument_id, &rows)?
    };
    Ok((refs, inserted))
}
