//! Metadata extraction.
//!
//! Reads the enumeration and instrument sections from the shared cursor, in
//! document order, leaving the cursor positioned before the value blocks.

use std::io::BufRead;

use tracing::{debug, info, warn};

use hm_common::{EnumerationTable, Enumeration, ParamId, ParameterRecord, ParameterTable, ValueType};

use crate::document::{DocumentCursor, DocumentError, Element, Node};

const ENUMERATIONS: &str = "Enumerations";
const INSTRUMENTS: &str = "Instruments";
const VALUES: &str = "Values";

/// The instrument section of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentSection {
    /// The `Name` attribute, matched against the settings registry.
    pub name: String,
    pub parameters: ParameterTable,
}

/// Read the `<Enumerations>` section.
///
/// A document without one yields an empty table; the cursor is left at the
/// next section.
pub fn extract_enumerations<R: BufRead>(
    cursor: &mut DocumentCursor<R>,
) -> Result<EnumerationTable, DocumentError> {
    let mut table = EnumerationTable::new();
    let Some(section) = cursor.seek(&[ENUMERATIONS, INSTRUMENTS, VALUES])? else {
        warn!("document has no enumerations section");
        return Ok(table);
    };
    if !section.is(ENUMERATIONS) {
        warn!(found = section.name(), "document has no enumerations section");
        cursor.unread(section);
        return Ok(table);
    }

    loop {
        match cursor.next_node()? {
            Node::Start(el) if el.is("Enumeration") => match el.attr_opt("Name") {
                Some(name) => {
                    let enumeration = read_enumeration(cursor, name.to_string())?;
                    table.insert(enumeration);
                }
                None => {
                    warn!("skipping enumeration without a name");
                    cursor.skip_element(&el)?;
                }
            },
            Node::Start(el) => cursor.skip_element(&el)?,
            Node::Text(_) => {}
            Node::End(_) => break,
            Node::Eof => return Err(DocumentError::UnexpectedEof(ENUMERATIONS.to_string())),
        }
    }

    info!(
        enumerations = table.len(),
        members = table.member_count(),
        "parsed enumerations"
    );
    for e in table.iter() {
        debug!(enumeration = %e.name, members = e.len(), "enumeration");
    }
    Ok(table)
}

fn read_enumeration<R: BufRead>(
    cursor: &mut DocumentCursor<R>,
    name: String,
) -> Result<Enumeration, DocumentError> {
    let mut enumeration = Enumeration::new(name);
    loop {
        match cursor.next_node()? {
            Node::Start(el) if el.is("Literal") => {
                let Some(literal) = el.attr_opt("Name").map(str::to_string) else {
                    warn!(enumeration = %enumeration.name, "skipping literal without a name");
                    cursor.skip_element(&el)?;
                    continue;
                };
                let text = cursor.read_text(&el)?;
                let value = text.trim().parse::<i32>().map_err(|_| DocumentError::InvalidLiteral {
                    enumeration: enumeration.name.clone(),
                    literal: literal.clone(),
                    value: text.clone(),
                })?;
                if !enumeration.add_member(literal.as_str(), value) {
                    warn!(enumeration = %enumeration.name, literal = %literal, "duplicate literal ignored");
                }
            }
            Node::Start(el) => cursor.skip_element(&el)?,
            Node::Text(_) => {}
            Node::End(_) => return Ok(enumeration),
            Node::Eof => return Err(DocumentError::UnexpectedEof("Enumeration".to_string())),
        }
    }
}

/// Read the `<Instruments>` section.
///
/// Only the first `<Instrument>` is used; any further instruments are skipped
/// with a warning. Parameters live two `<Component>` levels below it
/// (subsystem, then component).
pub fn extract_instrument<R: BufRead>(
    cursor: &mut DocumentCursor<R>,
) -> Result<InstrumentSection, DocumentError> {
    let Some(section) = cursor.seek(&[INSTRUMENTS, VALUES])? else {
        return Err(DocumentError::MissingInstrument);
    };
    if !section.is(INSTRUMENTS) {
        cursor.unread(section);
        return Err(DocumentError::MissingInstrument);
    }

    let mut found: Option<InstrumentSection> = None;
    loop {
        match cursor.next_node()? {
            Node::Start(el) if el.is("Instrument") => {
                if let Some(first) = &found {
                    warn!(
                        used = %first.name,
                        ignored = el.attr("Name").unwrap_or_default(),
                        "only one instrument per document is supported, skipping"
                    );
                    cursor.skip_element(&el)?;
                    continue;
                }
                let name = el
                    .attr_opt("Name")
                    .ok_or(DocumentError::MissingAttribute {
                        element: "Instrument",
                        attribute: "Name",
                    })?
                    .to_string();
                let mut parameters = ParameterTable::new();
                walk_subsystems(cursor, &mut parameters)?;
                found = Some(InstrumentSection { name, parameters });
            }
            Node::Start(el) => cursor.skip_element(&el)?,
            Node::Text(_) => {}
            Node::End(_) => break,
            Node::Eof => return Err(DocumentError::UnexpectedEof(INSTRUMENTS.to_string())),
        }
    }

    let section = found.ok_or(DocumentError::MissingInstrument)?;
    info!(
        instrument = %section.name,
        parameters = section.parameters.len(),
        "parsed parameters"
    );
    Ok(section)
}

/// Children of `<Instrument>`: subsystem components.
fn walk_subsystems<R: BufRead>(
    cursor: &mut DocumentCursor<R>,
    parameters: &mut ParameterTable,
) -> Result<(), DocumentError> {
    loop {
        match cursor.next_node()? {
            Node::Start(el) if el.is("Component") => {
                let subsystem = el.attr_opt("Name").map(str::to_string);
                walk_components(cursor, subsystem.as_deref(), parameters)?;
            }
            Node::Start(el) => cursor.skip_element(&el)?,
            Node::Text(_) => {}
            Node::End(_) => return Ok(()),
            Node::Eof => return Err(DocumentError::UnexpectedEof("Instrument".to_string())),
        }
    }
}

/// Children of a subsystem: components holding parameters.
fn walk_components<R: BufRead>(
    cursor: &mut DocumentCursor<R>,
    subsystem: Option<&str>,
    parameters: &mut ParameterTable,
) -> Result<(), DocumentError> {
    loop {
        match cursor.next_node()? {
            Node::Start(el) if el.is("Component") => {
                let component = el.attr_opt("Name").map(str::to_string);
                walk_parameters(cursor, subsystem, component.as_deref(), parameters)?;
            }
            Node::Start(el) => cursor.skip_element(&el)?,
            Node::Text(_) => {}
            Node::End(_) => return Ok(()),
            Node::Eof => return Err(DocumentError::UnexpectedEof("Component".to_string())),
        }
    }
}

fn walk_parameters<R: BufRead>(
    cursor: &mut DocumentCursor<R>,
    subsystem: Option<&str>,
    component: Option<&str>,
    parameters: &mut ParameterTable,
) -> Result<(), DocumentError> {
    loop {
        match cursor.next_node()? {
            Node::Start(el) if el.is("Parameter") => {
                if let Some(record) = parameter_record(&el, subsystem, component) {
                    if parameters.insert(record.param_id, record).is_some() {
                        warn!(param_id = %el.attr("ID").unwrap_or_default(), "duplicate parameter id, keeping the last");
                    }
                }
                cursor.skip_element(&el)?;
            }
            Node::Start(el) => cursor.skip_element(&el)?,
            Node::Text(_) => {}
            Node::End(_) => return Ok(()),
            Node::Eof => return Err(DocumentError::UnexpectedEof("Component".to_string())),
        }
    }
}

/// Build a parameter record; `None` (with a warning) if it is unusable.
fn parameter_record(
    el: &Element,
    subsystem: Option<&str>,
    component: Option<&str>,
) -> Option<ParameterRecord> {
    let raw_id = el.attr("ID").unwrap_or_default();
    let Some(param_id) = ParamId::parse(raw_id) else {
        warn!(id = raw_id, "skipping parameter with invalid ID");
        return None;
    };
    let raw_type = el.attr("Type").unwrap_or_default();
    let Some(value_type) = ValueType::from_export(raw_type) else {
        warn!(%param_id, kind = raw_type, "skipping parameter with unknown type");
        return None;
    };
    let name = el.attr_opt("Name").unwrap_or_else(|| {
        warn!(%param_id, "parameter has no name; storing it unnamed");
        ""
    });

    let owned = |key: &str| el.attr_opt(key).map(str::to_string);
    Some(ParameterRecord {
        param_id,
        subsystem: subsystem.map(str::to_string),
        component: component.map(str::to_string),
        name: name.to_string(),
        display_name: owned("DisplayName"),
        display_unit: owned("DisplayUnit"),
        storage_unit: owned("StorageUnit"),
        display_scale: owned("DisplayScale"),
        value_type,
        enum_name: owned("EnumerationName"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<HealthMonitorExport xmlns="HealthMonitorExport http://schemas.fei.com/HealthMonitor/Export/2009/07">
  <Enumerations>
    <Enumeration Name="FegState_enum">
      <Literal Name="Off">0</Literal>
      <Literal Name="Operate"> 4 </Literal>
    </Enumeration>
    <Enumeration Name="Empty_enum" />
  </Enumerations>
  <Instruments>
    <Instrument Name="9999, Test Instrument">
      <Component Name="Source">
        <Component Name="FEG">
          <Parameter ID="1" Name="FegState" DisplayName="FEG State" Type="Int" EnumerationName="FegState_enum" />
          <Parameter ID="2" Name="Emission" Type="Float" StorageUnit="A" DisplayUnit="uA" DisplayScale="" />
          <Parameter ID="x" Name="Broken" Type="Int" />
          <Parameter ID="3" Name="Odd" Type="Complex" />
        </Component>
      </Component>
      <Component Name="Vacuum">
        <Component>
          <Parameter ID="4" Name="Mode" Type="String" />
        </Component>
      </Component>
    </Instrument>
    <Instrument Name="Second">
      <Component Name="X"><Component Name="Y"><Parameter ID="9" Name="Z" Type="Int"/></Component></Component>
    </Instrument>
  </Instruments>
  <Values Start="2025-06-30T00:00:00Z" End="2025-07-01T00:00:00Z" />
</HealthMonitorExport>"#;

    #[test]
    fn test_enumerations_parsed_in_order() {
        let mut cursor = DocumentCursor::new(DOC.as_bytes());
        let table = extract_enumerations(&mut cursor).unwrap();
        assert_eq!(table.names().collect::<Vec<_>>(), ["FegState_enum", "Empty_enum"]);
        let feg = table.get("FegState_enum").unwrap();
        assert_eq!(feg.value_of("Operate"), Some(4));
        assert!(table.get("Empty_enum").unwrap().is_empty());
    }

    #[test]
    fn test_parameters_follow_enumerations() {
        let mut cursor = DocumentCursor::new(DOC.as_bytes());
        extract_enumerations(&mut cursor).unwrap();
        let section = extract_instrument(&mut cursor).unwrap();

        assert_eq!(section.name, "9999, Test Instrument");
        assert_eq!(
            section.parameters.keys().copied().collect::<Vec<_>>(),
            [ParamId(1), ParamId(2), ParamId(4)]
        );

        let feg = &section.parameters[&ParamId(1)];
        assert_eq!(feg.subsystem.as_deref(), Some("Source"));
        assert_eq!(feg.component.as_deref(), Some("FEG"));
        assert_eq!(feg.enum_name.as_deref(), Some("FegState_enum"));
        assert_eq!(feg.value_type, ValueType::Int);

        let emission = &section.parameters[&ParamId(2)];
        assert_eq!(emission.display_unit.as_deref(), Some("uA"));
        assert_eq!(emission.display_scale, None);
        assert_eq!(emission.display_name, None);

        let mode = &section.parameters[&ParamId(4)];
        assert_eq!(mode.component, None);
        assert_eq!(mode.value_type, ValueType::String);
    }

    #[test]
    fn test_unnamed_parameter_is_kept() {
        let doc = r#"<R><Instruments><Instrument Name="A">
            <Component Name="S"><Component Name="C">
              <Parameter ID="7" Type="Float" StorageUnit="K" />
            </Component></Component>
        </Instrument></Instruments></R>"#;
        let mut cursor = DocumentCursor::new(doc.as_bytes());
        extract_enumerations(&mut cursor).unwrap();
        let section = extract_instrument(&mut cursor).unwrap();
        let unnamed = &section.parameters[&ParamId(7)];
        assert_eq!(unnamed.name, "");
        assert_eq!(unnamed.storage_unit.as_deref(), Some("K"));
        assert_eq!(unnamed.value_type, ValueType::Float);
    }

    #[test]
    fn test_cursor_left_before_values() {
        let mut cursor = DocumentCursor::new(DOC.as_bytes());
        extract_enumerations(&mut cursor).unwrap();
        extract_instrument(&mut cursor).unwrap();
        let values = cursor.seek(&["Values"]).unwrap().unwrap();
        assert_eq!(values.attr("Start"), Some("2025-06-30T00:00:00Z"));
    }

    #[test]
    fn test_missing_enumerations_section() {
        let doc = r#"<R><Instruments><Instrument Name="A"/></Instruments></R>"#;
        let mut cursor = DocumentCursor::new(doc.as_bytes());
        assert!(extract_enumerations(&mut cursor).unwrap().is_empty());
        let section = extract_instrument(&mut cursor).unwrap();
        assert_eq!(section.name, "A");
        assert!(section.parameters.is_empty());
    }

    #[test]
    fn test_non_integer_literal_is_fatal() {
        let doc = r#"<R><Enumerations><Enumeration Name="E"><Literal Name="x">high</Literal></Enumeration></Enumerations></R>"#;
        let mut cursor = DocumentCursor::new(doc.as_bytes());
        let err = extract_enumerations(&mut cursor).unwrap_err();
        assert!(matches!(err, DocumentError::InvalidLiteral { ref value, .. } if value == "high"));
    }

    #[test]
    fn test_missing_instrument() {
        let doc = r#"<R><Enumerations/><Values/></R>"#;
        let mut cursor = DocumentCursor::new(doc.as_bytes());
        extract_enumerations(&mut cursor).unwrap();
        assert!(matches!(
            extract_instrument(&mut cursor),
            Err(DocumentError::MissingInstrument)
        ));
    }
}
