//! Crop knowledge base loaded once at startup.
//!
//! Two documents live in the data directory:
//! - `crops.json`: catalogue mapping crop name to varieties, regional sowing
//!   windows and aliases.
//! - `sowing_times.json`: variety/sowing-time table whose records extend the
//!   catalogue.
//!
//! The store is immutable after load and is shared between sessions via `Arc`.

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CATALOGUE_FILE: &str = "crops.json";
pub const SOWING_TABLE_FILE: &str = "sowing_times.json";

/// Errors raised while loading the knowledge files. Always fatal.
#[derive(Debug)]
pub enum DataLoadError {
    /// A data file is missing or unreadable.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// A data file is not valid JSON or does not match the expected shape.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Two catalogue entries (or an alias and an entry) normalize to the same key.
    DuplicateCrop { path: PathBuf, name: String },
    /// A table record names a crop the catalogue does not have.
    UnknownCrop { path: PathBuf, crop: String },
    /// Structurally valid JSON with unusable content (empty names and the like).
    Schema { path: PathBuf, reason: String },
}

impl fmt::Display for DataLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read data file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse data file '{}': {}", path.display(), source)
            }
            Self::DuplicateCrop { path, name } => {
                write!(f, "duplicate crop key '{}' in '{}'", name, path.display())
            }
            Self::UnknownCrop { path, crop } => {
                write!(f, "'{}' references unknown crop '{}'", path.display(), crop)
            }
            Self::Schema { path, reason } => {
                write!(f, "invalid data in '{}': {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for DataLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A lookup that found nothing usable. Recoverable: the engine turns it into
/// a "no data" reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFound {
    /// No crop within the fuzzy threshold.
    Crop(String),
    /// Several crops are equally close to the query.
    Ambiguous { query: String, candidates: Vec<String> },
    /// The crop exists but has no window for this region.
    Region { crop: String, region: String },
    /// The crop exists but the requested field is empty.
    NoData { crop: String, field: &'static str },
}

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crop(name) => write!(f, "no crop matching '{}'", name),
            Self::Ambiguous { query, candidates } => {
                write!(f, "'{}' is ambiguous: {}", query, candidates.join(", "))
            }
            Self::Region { crop, region } => {
                write!(f, "no sowing data for {} in '{}'", crop, region)
            }
            Self::NoData { crop, field } => write!(f, "no {} recorded for {}", field, crop),
        }
    }
}

impl std::error::Error for NotFound {}

/// One variety of a crop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variety {
    pub name: String,
    /// Variety-specific sowing time from the table, when known.
    pub sowing_time: Option<String>,
    pub description: Option<String>,
}

/// Reference data for a single crop.
#[derive(Debug, Clone)]
pub struct CropRecord {
    pub name: String,
    pub aliases: Vec<String>,
    pub varieties: Vec<Variety>,
    /// Region display name -> sowing window.
    pub sowing: BTreeMap<String, String>,
}

/// What to look up for a crop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Varieties,
    Regions,
    SowingTime { region: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Varieties(Vec<Variety>),
    Regions(Vec<String>),
    SowingWindow { region: String, window: String },
}

/// Successful lookup, carrying the canonical crop name that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub crop: String,
    pub value: FieldValue,
}

/// Indexed, read-only crop knowledge.
pub struct KnowledgeStore {
    crops: Vec<CropRecord>,
    /// Normalized name or alias -> index into `crops`.
    keys: HashMap<String, usize>,
    /// Multi-word keys, longest first, for phrase detection in free text.
    phrases: Vec<String>,
    /// Normalized region -> display region, across all crops.
    regions: HashMap<String, String>,
    fuzzy_threshold: usize,
}

// ==================== FILE FORMATS ====================

#[derive(Deserialize)]
struct CatalogueEntry {
    #[serde(default)]
    varieties: Vec<String>,
    #[serde(default)]
    sowing: BTreeMap<String, String>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    synonyms: Vec<Synonym>,
}

#[derive(Deserialize)]
struct Synonym {
    #[serde(default)]
    en: Option<String>,
    #[serde(default)]
    hi: Option<String>,
}

/// Catalogue entries in file order, keeping duplicate keys so they can be
/// reported instead of silently collapsed.
struct Catalogue(Vec<(String, CatalogueEntry)>);

impl<'de> Deserialize<'de> for Catalogue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CatalogueVisitor;

        impl<'de> Visitor<'de> for CatalogueVisitor {
            type Value = Catalogue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map from crop name to crop record")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Catalogue, A::Error> {
                let mut entries = Vec::new();
                while let Some((name, entry)) = map.next_entry::<String, CatalogueEntry>()? {
                    entries.push((name, entry));
                }
                Ok(Catalogue(entries))
            }
        }

        deserializer.deserialize_map(CatalogueVisitor)
    }
}

#[derive(Deserialize)]
struct SowingTable {
    #[serde(default)]
    records: Vec<SowingRecord>,
}

#[derive(Deserialize)]
struct SowingRecord {
    #[serde(alias = "Crop")]
    crop: String,
    #[serde(default, alias = "Variety")]
    variety: Option<String>,
    #[serde(default, alias = "Sowing_Time", alias = "Sowing Time")]
    sowing_time: Option<String>,
    #[serde(default, alias = "Region")]
    region: Option<String>,
    #[serde(default, alias = "Description")]
    description: Option<String>,
}

// ==================== LOADING ====================

impl KnowledgeStore {
    /// Load both knowledge files from `dir`.
    pub fn load(dir: &Path, fuzzy_threshold: usize) -> Result<Self, DataLoadError> {
        let catalogue_path = dir.join(CATALOGUE_FILE);
        let table_path = dir.join(SOWING_TABLE_FILE);

        let catalogue_json = read(&catalogue_path)?;
        let table_json = read(&table_path)?;

        let store = Self::parse(&catalogue_json, &catalogue_path, &table_json, &table_path, fuzzy_threshold)?;
        info!(
            "Loaded knowledge base from {:?} ({} crops, {} regions)",
            dir,
            store.crops.len(),
            store.regions.len()
        );
        Ok(store)
    }

    /// Build a store from in-memory JSON documents.
    pub fn from_json(catalogue: &str, table: &str, fuzzy_threshold: usize) -> Result<Self, DataLoadError> {
        Self::parse(
            catalogue,
            Path::new(CATALOGUE_FILE),
            table,
            Path::new(SOWING_TABLE_FILE),
            fuzzy_threshold,
        )
    }

    fn parse(
        catalogue_json: &str,
        catalogue_path: &Path,
        table_json: &str,
        table_path: &Path,
        fuzzy_threshold: usize,
    ) -> Result<Self, DataLoadError> {
        let catalogue: Catalogue = serde_json::from_str(catalogue_json)
            .map_err(|e| DataLoadError::ParseJson { path: catalogue_path.to_path_buf(), source: e })?;
        let table: SowingTable = serde_json::from_str(table_json)
            .map_err(|e| DataLoadError::ParseJson { path: table_path.to_path_buf(), source: e })?;

        let mut store = Self {
            crops: Vec::with_capacity(catalogue.0.len()),
            keys: HashMap::new(),
            phrases: Vec::new(),
            regions: HashMap::new(),
            fuzzy_threshold,
        };

        // Names first so an alias can never shadow another crop's own name.
        for (name, _) in &catalogue.0 {
            let key = normalize(name);
            if key.is_empty() {
                return Err(DataLoadError::Schema {
                    path: catalogue_path.to_path_buf(),
                    reason: "crop name is empty".into(),
                });
            }
            if store.keys.insert(key, store.crops.len()).is_some() {
                return Err(DataLoadError::DuplicateCrop {
                    path: catalogue_path.to_path_buf(),
                    name: name.clone(),
                });
            }
            store.crops.push(CropRecord {
                name: name.trim().to_string(),
                aliases: Vec::new(),
                varieties: Vec::new(),
                sowing: BTreeMap::new(),
            });
        }

        for (idx, (_, entry)) in catalogue.0.into_iter().enumerate() {
            let aliases = entry
                .aliases
                .into_iter()
                .chain(entry.synonyms.into_iter().flat_map(|s| s.en.into_iter().chain(s.hi)));
            for alias in aliases {
                let key = normalize(&alias);
                if key.is_empty() {
                    continue;
                }
                match store.keys.get(&key) {
                    Some(&owner) if owner == idx => {}
                    Some(_) => {
                        return Err(DataLoadError::DuplicateCrop {
                            path: catalogue_path.to_path_buf(),
                            name: alias,
                        });
                    }
                    None => {
                        store.keys.insert(key, idx);
                        store.crops[idx].aliases.push(alias.trim().to_string());
                    }
                }
            }

            for variety in entry.varieties {
                store.add_variety(idx, &variety, None, None, catalogue_path)?;
            }
            for (region, window) in entry.sowing {
                store.add_window(idx, &region, &window, catalogue_path)?;
            }
        }

        for record in table.records {
            let idx = store
                .keys
                .get(&normalize(&record.crop))
                .copied()
                .ok_or_else(|| DataLoadError::UnknownCrop {
                    path: table_path.to_path_buf(),
                    crop: record.crop.clone(),
                })?;
            let sowing_time = record.sowing_time.as_deref().map(str::trim).filter(|s| !s.is_empty());
            let description = record.description.as_deref().map(str::trim).filter(|s| !s.is_empty());
            if let Some(variety) = record.variety.as_deref() {
                store.add_variety(idx, variety, sowing_time, description, table_path)?;
            }
            if let (Some(region), Some(window)) = (record.region.as_deref(), sowing_time) {
                store.add_window(idx, region, window, table_path)?;
            }
        }

        let mut phrases: Vec<String> = store.keys.keys().filter(|k| k.contains(' ')).cloned().collect();
        phrases.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then_with(|| a.cmp(b)));
        store.phrases = phrases;

        Ok(store)
    }

    fn add_variety(
        &mut self,
        idx: usize,
        name: &str,
        sowing_time: Option<&str>,
        description: Option<&str>,
        path: &Path,
    ) -> Result<(), DataLoadError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DataLoadError::Schema {
                path: path.to_path_buf(),
                reason: format!("empty variety name for {}", self.crops[idx].name),
            });
        }
        let crop = &mut self.crops[idx];
        match crop.varieties.iter_mut().find(|v| v.name.eq_ignore_ascii_case(name)) {
            Some(existing) => {
                if existing.sowing_time.is_none() {
                    existing.sowing_time = sowing_time.map(str::to_string);
                }
                if existing.description.is_none() {
                    existing.description = description.map(str::to_string);
                }
            }
            None => crop.varieties.push(Variety {
                name: name.to_string(),
                sowing_time: sowing_time.map(str::to_string),
                description: description.map(str::to_string),
            }),
        }
        Ok(())
    }

    fn add_window(&mut self, idx: usize, region: &str, window: &str, path: &Path) -> Result<(), DataLoadError> {
        let key = normalize(region);
        let window = window.trim();
        if key.is_empty() || window.is_empty() {
            return Err(DataLoadError::Schema {
                path: path.to_path_buf(),
                reason: format!("empty region or sowing window for {}", self.crops[idx].name),
            });
        }
        let region_name = self
            .regions
            .entry(key.clone())
            .or_insert_with(|| region.trim().to_string())
            .clone();
        let crop = &mut self.crops[idx];
        if let Some(existing) = crop.sowing.get(&region_name) {
            if existing != window {
                debug!("Keeping first sowing window for {} in {}: {} (ignoring {})", crop.name, region_name, existing, window);
            }
            return Ok(());
        }
        crop.sowing.insert(region_name, window.to_string());
        Ok(())
    }
}

fn read(path: &Path) -> Result<String, DataLoadError> {
    std::fs::read_to_string(path).map_err(|e| DataLoadError::ReadFile { path: path.to_path_buf(), source: e })
}

// ==================== LOOKUPS ====================

impl KnowledgeStore {
    pub fn crops(&self) -> &[CropRecord] {
        &self.crops
    }

    pub fn crop_count(&self) -> usize {
        self.crops.len()
    }

    /// Look up a field of a crop.
    ///
    /// Matching is case-, whitespace- and punctuation-insensitive, with an
    /// edit-distance fallback bounded by the configured threshold.
    pub fn lookup(&self, crop_name: &str, field: &Field) -> Result<Answer, NotFound> {
        let crop = self.resolve_crop(crop_name)?;

        let value = match field {
            Field::Varieties => {
                if crop.varieties.is_empty() {
                    return Err(NotFound::NoData { crop: crop.name.clone(), field: "varieties" });
                }
                FieldValue::Varieties(crop.varieties.clone())
            }
            Field::Regions => {
                if crop.sowing.is_empty() {
                    return Err(NotFound::NoData { crop: crop.name.clone(), field: "sowing regions" });
                }
                FieldValue::Regions(crop.sowing.keys().cloned().collect())
            }
            Field::SowingTime { region } => {
                let (display, window) = self.resolve_region(crop, region)?;
                FieldValue::SowingWindow { region: display.clone(), window: window.clone() }
            }
        };

        Ok(Answer { crop: crop.name.clone(), value })
    }

    /// Find the crop a name refers to.
    pub fn resolve_crop(&self, query: &str) -> Result<&CropRecord, NotFound> {
        let key = normalize(query);
        if key.is_empty() {
            return Err(NotFound::Crop(query.trim().to_string()));
        }
        if let Some(&idx) = self.keys.get(&key) {
            return Ok(&self.crops[idx]);
        }

        let threshold = self.threshold_for(&key);
        let mut best = usize::MAX;
        let mut hits: Vec<usize> = Vec::new();
        for (candidate, &idx) in &self.keys {
            let distance = levenshtein(&key, candidate);
            if distance < best {
                best = distance;
                hits.clear();
            }
            if distance == best && !hits.contains(&idx) {
                hits.push(idx);
            }
        }

        if best > threshold || hits.is_empty() {
            return Err(NotFound::Crop(query.trim().to_string()));
        }
        if hits.len() > 1 {
            let mut candidates: Vec<String> = hits.iter().map(|&i| self.crops[i].name.clone()).collect();
            candidates.sort();
            return Err(NotFound::Ambiguous { query: query.trim().to_string(), candidates });
        }
        debug!("Fuzzy crop match: {:?} -> {} (distance {})", query, self.crops[hits[0]].name, best);
        Ok(&self.crops[hits[0]])
    }

    fn resolve_region<'a>(&self, crop: &'a CropRecord, region: &str) -> Result<(&'a String, &'a String), NotFound> {
        let key = normalize(region);
        let not_found = || NotFound::Region { crop: crop.name.clone(), region: region.trim().to_string() };
        if key.is_empty() {
            return Err(not_found());
        }
        if let Some(hit) = crop.sowing.iter().find(|(name, _)| normalize(name) == key) {
            return Ok(hit);
        }

        let threshold = self.threshold_for(&key);
        let mut scored: Vec<(usize, (&'a String, &'a String))> = crop
            .sowing
            .iter()
            .map(|entry| (levenshtein(&key, &normalize(entry.0)), entry))
            .filter(|(d, _)| *d <= threshold)
            .collect();
        scored.sort_by_key(|(d, _)| *d);
        match scored.as_slice() {
            [(_, hit)] => Ok(*hit),
            [(d0, hit), (d1, _), ..] if d0 < d1 => Ok(*hit),
            _ => Err(not_found()),
        }
    }

    /// Detect a crop mentioned somewhere inside free text.
    ///
    /// Multi-word names win over single words, exact matches over fuzzy ones.
    /// Returns the canonical crop name, or `None` when nothing (or more than one
    /// crop) is mentioned.
    pub fn find_crop_in(&self, text: &str) -> Option<String> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return None;
        }

        let padded = format!(" {} ", normalized);
        for phrase in &self.phrases {
            if padded.contains(&format!(" {} ", phrase)) {
                return Some(self.crops[self.keys[phrase]].name.clone());
            }
        }

        let tokens: Vec<&str> = normalized.split(' ').collect();
        let mut exact: Vec<usize> = tokens.iter().filter_map(|t| self.keys.get(*t).copied()).collect();
        exact.sort_unstable();
        exact.dedup();
        match exact.as_slice() {
            [idx] => return Some(self.crops[*idx].name.clone()),
            [_, ..] => return None,
            [] => {}
        }

        let mut fuzzy: Vec<usize> = Vec::new();
        for token in tokens.iter().filter(|t| t.chars().count() >= 4) {
            if let Ok(crop) = self.resolve_crop(token) {
                let idx = self.keys[&normalize(&crop.name)];
                if !fuzzy.contains(&idx) {
                    fuzzy.push(idx);
                }
            }
        }
        match fuzzy.as_slice() {
            [idx] => Some(self.crops[*idx].name.clone()),
            _ => None,
        }
    }

    /// Canonical display name of a region known for any crop.
    pub fn find_region(&self, text: &str) -> Option<String> {
        let key = normalize(text);
        if key.is_empty() {
            return None;
        }
        if let Some(display) = self.regions.get(&key) {
            return Some(display.clone());
        }
        let threshold = self.threshold_for(&key);
        let mut best: Option<(usize, &String)> = None;
        let mut tied = false;
        for (candidate, display) in &self.regions {
            let distance = levenshtein(&key, candidate);
            if distance > threshold {
                continue;
            }
            match best {
                Some((d, _)) if distance > d => {}
                Some((d, _)) if distance == d => tied = true,
                _ => {
                    best = Some((distance, display));
                    tied = false;
                }
            }
        }
        match best {
            Some((_, display)) if !tied => Some(display.clone()),
            _ => None,
        }
    }

    /// Short keys tolerate fewer edits: "pea" must not match "tea".
    fn threshold_for(&self, key: &str) -> usize {
        match key.chars().count() {
            0..=3 => 0,
            4..=5 => self.fuzzy_threshold.min(1),
            _ => self.fuzzy_threshold,
        }
    }
}

/// Lowercase, strip punctuation and collapse whitespace.
///
/// Letters and digits of any script survive, as does the whole Devanagari
/// block so vowel signs and viramas stay attached to their words.
pub fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;
    for c in s.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() || ('\u{0900}'..='\u{097F}').contains(&c) {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        } else {
            pending_space = true;
        }
    }
    out
}

/// Character-level Levenshtein distance.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
