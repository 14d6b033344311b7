//! TXT field parsing for the two Matter service types (spec §4.D steps 3, 5).

use crate::collab::DeviceMetadata;
use crate::dns::RecordValue;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationalTxt {
    pub metadata: DeviceMetadata,
    pub device_type: Option<u32>,
    pub pairing_hint: Option<u16>,
}

pub fn parse_operational_txt(pairs: &[(String, String)]) -> OperationalTxt {
    let mut out = OperationalTxt::default();
    for (k, v) in pairs {
        match k.as_str() {
            "T" => out.metadata.tcp_supported = v == "1",
            "ICD" => out.metadata.icd = v == "1",
            "DT" => out.device_type = v.parse().ok(),
            "PH" => out.pairing_hint = v.parse().ok(),
            "SII" => out.metadata.sii_ms = v.parse().ok(),
            "SAI" => out.metadata.sai_ms = v.parse().ok(),
            "SAT" => out.metadata.sat_ms = v.parse().ok(),
            _ => {}
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommissionableTxt {
    pub long_discriminator: Option<u16>,
    pub short_discriminator: Option<u8>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub device_type: Option<u32>,
    pub commissioning_mode: Option<u8>,
    pub friendly_name: Option<String>,
    pub rotating_id: Option<String>,
    pub pairing_hint: Option<u16>,
}

/// Parse commissionable TXT fields (spec §4.D step 5). Derives `SD` from
/// `D`'s upper bits when the short discriminator wasn't advertised
/// directly, and splits a combined `VP` field into vendor/product.
pub fn parse_commissionable_txt(pairs: &[(String, String)]) -> CommissionableTxt {
    let mut out = CommissionableTxt::default();
    for (k, v) in pairs {
        match k.as_str() {
            "D" => out.long_discriminator = v.parse().ok(),
            "SD" => out.short_discriminator = v.parse().ok(),
            "V" => out.vendor_id = v.parse().ok(),
            "P" => out.product_id = v.parse().ok(),
            "DT" => out.device_type = v.parse().ok(),
            "CM" => out.commissioning_mode = v.parse().ok(),
            "DN" => out.friendly_name = Some(v.clone()),
            "RI" => out.rotating_id = Some(v.clone()),
            "PH" => out.pairing_hint = v.parse().ok(),
            "VP" => {
                if let Some((vendor, product)) = v.split_once('+') {
                    out.vendor_id = vendor.parse().ok();
                    out.product_id = product.parse().ok();
                }
            }
            _ => {}
        }
    }
    if out.short_discriminator.is_none() {
        if let Some(d) = out.long_discriminator {
            out.short_discriminator = Some(((d >> 8) & 0x0F) as u8);
        }
    }
    out
}

/// Matching criteria for a commissionable-device query (spec §4.D,
/// §6 sub-service list).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommissionableIdentifier {
    Instance(String),
    LongDiscriminator(u16),
    ShortDiscriminator(u8),
    VendorProduct(u16, u16),
    Vendor(u16),
    DeviceType(u32),
    Product(u16),
    Any,
}

impl CommissionableIdentifier {
    /// The DNS-SD sub-service name this identifier maps to (spec §6):
    /// `_L<D>`, `_S<SD>`, `_V<V>`, `_T<DT>`, or the `_CM` wildcard. The
    /// synthetic `VP`/`P` keys have no wire sub-service; they're matched
    /// only against already-cached TXT fields.
    pub fn sub_service(&self) -> Option<String> {
        match self {
            CommissionableIdentifier::Instance(_) => None,
            CommissionableIdentifier::LongDiscriminator(d) => Some(format!("_L{d}")),
            CommissionableIdentifier::ShortDiscriminator(sd) => Some(format!("_S{sd}")),
            CommissionableIdentifier::Vendor(v) => Some(format!("_V{v}")),
            CommissionableIdentifier::DeviceType(dt) => Some(format!("_T{dt}")),
            CommissionableIdentifier::VendorProduct(..) | CommissionableIdentifier::Product(_) => {
                None
            }
            CommissionableIdentifier::Any => Some("_CM".to_string()),
        }
    }

    pub fn matches(&self, txt: &CommissionableTxt, instance_name: &str) -> bool {
        match self {
            CommissionableIdentifier::Instance(name) => name == instance_name,
            CommissionableIdentifier::LongDiscriminator(d) => txt.long_discriminator == Some(*d),
            CommissionableIdentifier::ShortDiscriminator(sd) => {
                txt.short_discriminator == Some(*sd)
            }
            CommissionableIdentifier::VendorProduct(v, p) => {
                txt.vendor_id == Some(*v) && txt.product_id == Some(*p)
            }
            CommissionableIdentifier::Vendor(v) => txt.vendor_id == Some(*v),
            CommissionableIdentifier::DeviceType(dt) => txt.device_type == Some(*dt),
            CommissionableIdentifier::Product(p) => txt.product_id == Some(*p),
            CommissionableIdentifier::Any => txt.commissioning_mode.unwrap_or(0) != 0,
        }
    }
}

pub fn record_type_for(value: &RecordValue) -> &'static str {
    match value {
        RecordValue::Ptr(_) => "PTR",
        RecordValue::Srv { .. } => "SRV",
        RecordValue::Txt(_) => "TXT",
        RecordValue::A(_) => "A",
        RecordValue::Aaaa(_) => "AAAA",
    }
}
