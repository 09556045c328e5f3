//! Hardware report parsing.
//!
//! Nodes expose their hardware inventory as an lshw XML document. The
//! document is read into a generic [`HardwareNode`] tree and then walked
//! recursively to find every element classified as `network`, which carries
//! the interface's logical name and its MAC address (the `serial` child).

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{FleetError, Result};

/// Class attribute value marking a network device.
const NETWORK_CLASS: &str = "network";
/// Child element holding the kernel interface name.
const LOGICAL_NAME: &str = "logicalname";
/// Child element holding the MAC address of a network device.
const SERIAL: &str = "serial";

/// One element of a hardware report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareNode {
    /// Element name (e.g., "node", "serial").
    pub tag: String,
    /// Element attributes.
    pub attributes: HashMap<String, String>,
    /// Concatenated text content.
    pub text: String,
    /// Child elements in document order.
    pub children: Vec<HardwareNode>,
}

impl HardwareNode {
    fn from_start(start: &BytesStart<'_>) -> Self {
        let attributes = start
            .attributes()
            .with_checks(false)
            .filter_map(std::result::Result::ok)
            .filter_map(|attr| {
                let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                let value = attr.unescape_value().ok()?.into_owned();
                Some((key, value))
            })
            .collect();

        Self {
            tag: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attributes,
            text: String::new(),
            children: Vec::new(),
        }
    }

    /// Attribute value by name.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// The lshw `class` attribute.
    #[must_use]
    pub fn class(&self) -> Option<&str> {
        self.attr("class")
    }

    /// First direct child with the given element name.
    #[must_use]
    pub fn child(&self, tag: &str) -> Option<&HardwareNode> {
        self.children.iter().find(|c| c.tag == tag)
    }

    /// Trimmed text of a direct child, if present and non-empty.
    #[must_use]
    pub fn child_text(&self, tag: &str) -> Option<&str> {
        self.child(tag)
            .map(|c| c.text.trim())
            .filter(|t| !t.is_empty())
    }
}

/// A network interface found in a hardware report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredInterface {
    /// MAC address (the lshw `serial`).
    pub mac: String,
    /// Kernel interface name (e.g., "eth0").
    pub name: String,
}

/// Parse a hardware report into its root element.
///
/// Parsing stops at the end of the first root element; anything after it is
/// ignored.
///
/// # Errors
/// Returns [`FleetError::Parse`] if the document is not well-formed.
pub fn parse_report(report: &[u8]) -> Result<HardwareNode> {
    let mut reader = Reader::from_reader(report);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<HardwareNode> = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| parse_error(&reader, &e))?;

        match event {
            Event::Start(start) => stack.push(HardwareNode::from_start(&start)),
            Event::Empty(start) => {
                let node = HardwareNode::from_start(&start);
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Ok(node),
                }
            }
            Event::End(_) => {
                let Some(node) = stack.pop() else {
                    return Err(FleetError::Parse("unexpected closing tag".into()));
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Ok(node),
                }
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    let text = text.unescape().map_err(|e| parse_error(&reader, &e))?;
                    current.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => {
                return Err(FleetError::Parse(if stack.is_empty() {
                    "document has no root element".into()
                } else {
                    "unexpected end of document".into()
                }));
            }
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
        }
        buf.clear();
    }
}

fn parse_error<R>(reader: &Reader<R>, err: &impl std::fmt::Display) -> FleetError {
    FleetError::Parse(format!("at byte {}: {err}", reader.buffer_position()))
}

fn collect_interfaces(node: &HardwareNode, found: &mut Vec<DiscoveredInterface>) {
    if node.class() == Some(NETWORK_CLASS) {
        if let (Some(name), Some(mac)) = (node.child_text(LOGICAL_NAME), node.child_text(SERIAL)) {
            match found.iter_mut().find(|i| i.mac == mac) {
                Some(existing) => name.clone_into(&mut existing.name),
                None => found.push(DiscoveredInterface {
                    mac: mac.to_string(),
                    name: name.to_string(),
                }),
            }
        }
    }
    for child in &node.children {
        collect_interfaces(child, found);
    }
}

/// Network interfaces of a hardware report, in document order.
///
/// A MAC address seen more than once keeps its first position and the name
/// of its last occurrence.
///
/// # Errors
/// Returns [`FleetError::Parse`] if the document is not well-formed.
pub fn discover_interfaces(report: &[u8]) -> Result<Vec<DiscoveredInterface>> {
    let root = parse_report(report)?;
    let mut found = Vec::new();
    collect_interfaces(&root, &mut found);
    Ok(found)
}

/// Map of MAC address to interface name for every network device in a report.
///
/// # Errors
/// Returns [`FleetError::Parse`] if the document is not well-formed.
pub fn extract_interfaces(report: &[u8]) -> Result<HashMap<String, String>> {
    Ok(discover_interfaces(report)?
        .into_iter()
        .map(|i| (i.mac, i.name))
        .collect())
}
