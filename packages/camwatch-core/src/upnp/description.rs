//! UPnP device description documents.
//!
//! Only the root device's flat, text-only children are kept (`friendlyName`,
//! `presentationURL`, `modelName`, ...). Structured children such as
//! `serviceList` and embedded devices are ignored.

use std::collections::BTreeMap;

use crate::protocol_constants::UPNP_MAJOR_VERSION;
use crate::xml::{self, XmlElement, XmlError, XmlResult};

/// What a control point keeps from a description document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescription {
    /// Deprecated `URLBase`, used to resolve a relative `presentationURL`.
    pub url_base: Option<String>,
    /// Simple child elements of the root `<device>`, by local name.
    pub attributes: BTreeMap<String, String>,
}

/// Parses a description document.
///
/// Fails unless the document has exactly one `specVersion` whose major
/// version is supported and exactly one `<device>` directly under `<root>`.
pub fn parse_description(body: &str) -> XmlResult<DeviceDescription> {
    let doc = xml::parse(body)?;

    let spec_versions = doc.find_all("specVersion");
    let [spec_version] = spec_versions.as_slice() else {
        return Err(XmlError::InvalidValue {
            element: "specVersion",
            value: format!("{} elements", spec_versions.len()),
        });
    };
    let major = spec_version.require_text("major")?;
    if major.parse::<u32>().ok() != Some(UPNP_MAJOR_VERSION) {
        return Err(XmlError::InvalidValue {
            element: "major",
            value: major,
        });
    }

    let url_base = match doc.find_all("URLBase").as_slice() {
        [only] if !only.text.is_empty() => Some(only.text.clone()),
        _ => None,
    };

    let devices = root_devices(&doc);
    let [device] = devices.as_slice() else {
        return Err(XmlError::InvalidValue {
            element: "device",
            value: format!("{} root devices", devices.len()),
        });
    };

    let attributes = device
        .children
        .iter()
        .filter(|c| c.is_simple())
        .map(|c| (c.name.clone(), c.text.clone()))
        .collect();

    Ok(DeviceDescription {
        url_base,
        attributes,
    })
}

/// `<device>` elements whose parent is a `<root>` element.
fn root_devices(doc: &XmlElement) -> Vec<&XmlElement> {
    let mut roots = doc.find_all("root");
    if doc.name == "root" {
        roots.insert(0, doc);
    }
    roots
        .into_iter()
        .flat_map(|root| root.children.iter().filter(|c| c.name == "device"))
        .collect()
}
