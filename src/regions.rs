//! Binary regions of interest, loaded from a manifest file.
//!
//! A region is a named `[start, end)` range of load-relative addresses for
//! which the simulator produces a separate report. Three manifest formats are
//! accepted, sniffed from the first non-whitespace byte:
//!
//! - plain text, one region per line: `start end description`
//! - a JSON array of `{"start", "end", "description"}` objects
//! - a JSON object `{"file": <elf>, "regions": [{"symbol", ...}]}` whose
//!   regions are resolved against the ELF's symbol table

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use goblin::Object;
use serde::Deserialize;

use crate::Address;

/// A named address range, load-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRegion {
    /// Human-readable region name, reported back by the broker
    pub description: String,
    /// First address of the region
    pub start: Address,
    /// One past the last address of the region
    pub end: Address,
}

impl fmt::Display for BinaryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{}>, address: [ {:#x} - {:#x} ]",
            self.description, self.start, self.end
        )
    }
}

/// Error type for manifest loading
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    /// Failed to read the manifest or referenced object file
    #[error("Failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest is not valid JSON
    #[error("Failed to parse manifest: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON manifest that is neither address- nor symbol-based
    #[error("Unrecognized manifest format")]
    UnrecognizedFormat,

    /// Referenced object file could not be parsed
    #[error("Failed to parse object file: {0}")]
    Object(#[from] goblin::error::Error),

    /// Referenced object file is not ELF
    #[error("Unsupported binary format, only ELF is supported")]
    UnsupportedBinary,
}

/// Address-based JSON region entry; addresses may be numbers or strings.
#[derive(Deserialize)]
struct AddressRegion {
    start: AddrValue,
    end: AddrValue,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AddrValue {
    Number(u64),
    Text(String),
}

impl AddrValue {
    fn resolve(&self) -> Option<Address> {
        match self {
            AddrValue::Number(n) => Some(*n),
            AddrValue::Text(s) => parse_address(s),
        }
    }
}

/// Symbol-based JSON manifest.
#[derive(Deserialize)]
struct SymbolManifest {
    file: String,
    regions: Vec<SymbolRegion>,
}

#[derive(Deserialize)]
struct SymbolRegion {
    symbol: String,
    #[serde(default)]
    description: Option<String>,
    /// Optional `[start_offset, end_offset]` applied to the symbol's range
    #[serde(default)]
    offsets: Vec<i64>,
}

/// Parse a decimal or `0x`-prefixed hexadecimal address.
fn parse_address(text: &str) -> Option<Address> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Address::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

/// The loaded manifest: an exact-start interval lookup.
///
/// The emulator only reports block-granular execution, so lookups match a
/// region only at its exact start address; termination is tested elsewhere
/// against `region.end`.
#[derive(Debug, Default)]
pub struct BinaryRegions {
    // Sorted by start address
    regions: Vec<Arc<BinaryRegion>>,
}

impl BinaryRegions {
    /// Load a manifest from a file, sniffing the format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RegionError> {
        let text = fs::read_to_string(path)?;
        match text.trim_start().chars().next() {
            Some('[') | Some('{') => Self::from_json(&text),
            _ => Ok(Self::from_text(&text)),
        }
    }

    /// Parse the plain-text format: one `start end description` per line.
    /// Blank lines and `#` comments are skipped; malformed lines are logged.
    pub fn from_text(text: &str) -> Self {
        let mut regions = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let start = fields.next().and_then(parse_address);
            let end = fields.next().and_then(parse_address);
            let description = fields.collect::<Vec<_>>().join(" ");
            match (start, end) {
                (Some(start), Some(end)) => regions.push(BinaryRegion {
                    description,
                    start,
                    end,
                }),
                _ => log::warn!("Skipping malformed region on line {}", lineno + 1),
            }
        }
        Self::from_regions(regions)
    }

    fn from_json(text: &str) -> Result<Self, RegionError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.is_array() {
            let raw: Vec<AddressRegion> = serde_json::from_value(value)?;
            let mut regions = Vec::new();
            for entry in raw {
                match (entry.start.resolve(), entry.end.resolve()) {
                    (Some(start), Some(end)) => regions.push(BinaryRegion {
                        description: entry.description,
                        start,
                        end,
                    }),
                    _ => log::warn!("Skipping region with unparsable address"),
                }
            }
            Ok(Self::from_regions(regions))
        } else if value.get("file").is_some() && value.get("regions").is_some() {
            let manifest: SymbolManifest = serde_json::from_value(value)?;
            Self::from_symbols(manifest)
        } else {
            Err(RegionError::UnrecognizedFormat)
        }
    }

    /// Resolve a symbol-based manifest against the ELF it names.
    fn from_symbols(manifest: SymbolManifest) -> Result<Self, RegionError> {
        let image = fs::read(&manifest.file)?;
        let elf = match Object::parse(&image)? {
            Object::Elf(elf) => elf,
            _ => return Err(RegionError::UnsupportedBinary),
        };

        // Symbol name -> (address, size)
        let mut symbols: HashMap<&str, (u64, u64)> = HashMap::new();
        for sym in elf.syms.iter() {
            if let Some(name) = elf.strtab.get_at(sym.st_name) {
                symbols.insert(name, (sym.st_value, sym.st_size));
            }
        }

        let mut regions = Vec::new();
        for entry in manifest.regions {
            let Some(&(addr, size)) = symbols.get(entry.symbol.as_str()) else {
                log::warn!("Symbol {} not found", entry.symbol);
                continue;
            };

            // Start offset cannot be negative.
            let start_off = entry.offsets.first().copied().unwrap_or(0).max(0);
            let end_off = entry.offsets.get(1).copied().unwrap_or(0);
            regions.push(BinaryRegion {
                description: entry.description.unwrap_or(entry.symbol),
                start: addr.wrapping_add(start_off as u64),
                end: addr.wrapping_add(size).wrapping_add(end_off as u64),
            });
        }
        Ok(Self::from_regions(regions))
    }

    /// Build the lookup table. Duplicate start addresses are logged; the
    /// first entry wins.
    pub fn from_regions(mut regions: Vec<BinaryRegion>) -> Self {
        regions.sort_by_key(|region| region.start);

        let mut unique: Vec<Arc<BinaryRegion>> = Vec::with_capacity(regions.len());
        for region in regions {
            if let Some(last) = unique.last() {
                if last.start == region.start {
                    log::error!(
                        "Entry for starting address {:#x} already exists",
                        region.start
                    );
                    continue;
                }
            }
            log::debug!("Found region {}", region);
            unique.push(Arc::new(region));
        }
        Self { regions: unique }
    }

    /// Return the region whose start address equals `offset` exactly.
    pub fn lookup(&self, offset: Address) -> Option<&Arc<BinaryRegion>> {
        self.regions
            .binary_search_by_key(&offset, |region| region.start)
            .ok()
            .map(|i| &self.regions[i])
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BinaryRegion>> {
        self.regions.iter()
    }
}
