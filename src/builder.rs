//! Two-pass construction of a shared + composite dictionary pair.
//!
//! ## Process
//!
//! 1. Pass 1: split every term and collect the shareable parts, plus the empty
//!    string, into `shared.dict`
//! 2. Pass 2: split every term again, resolve its shared part to an id and
//!    collect `[code][marker][local]` keys into `strings.dict`
//! 3. Both files are reopened, validated and described in `build.json`
//!
//! Shared ids above the configured limit cannot be coded; such terms are
//! stored whole under the sentinel code and the composite file is flagged.

use crate::config::CompositeOptions;
use crate::dict::splitter::{composite_key, encode_shared_id, SENTINEL_SHARED_ID};
use crate::dict::{
    CompositeLookup, Dict, DictFlags, SharedSide, SortedLookup, SplitMode, Splitter, TermLookup,
    TermSyntax, TermView,
};
use crate::error::{Error, Result};
use crate::sort::DictSorter;
use crate::NOT_FOUND;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the shared dictionary.
pub const SHARED_DICT_FILE: &str = "shared.dict";
/// File name of the composite dictionary.
pub const COMPOSITE_DICT_FILE: &str = "strings.dict";
/// File name of the build report.
pub const BUILD_REPORT_FILE: &str = "build.json";

/// Summary of a finished build, stored as `build.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    /// Path of the shared dictionary.
    pub shared_path: PathBuf,
    /// Path of the composite dictionary.
    pub composite_path: PathBuf,
    /// Distinct shared parts, including the empty string.
    pub shared_terms: u64,
    /// Distinct terms in the composite dictionary.
    pub composite_terms: u64,
    /// Terms fed to pass 2, duplicates included.
    pub terms_added: u64,
    /// Terms stored whole because their shared id exceeded the limit.
    pub overflowed: u64,
    /// Header flags of the composite dictionary.
    pub flags: u8,
    /// Split mode used by both passes.
    pub split_mode: SplitMode,
    /// Largest shared id that was coded.
    pub shared_id_limit: u64,
}

impl BuildReport {
    /// Read `build.json` from `dir`.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(BUILD_REPORT_FILE);
        let json = fs::read_to_string(&path)?;
        serde_json::from_str(&json)
            .map_err(|e| Error::corruption(format!("Failed to parse build report {:?}: {}", path, e)))
    }

    fn store(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::invalid_state(format!("Failed to serialize build report: {}", e)))?;
        fs::write(dir.join(BUILD_REPORT_FILE), json)?;
        Ok(())
    }
}

/// The dictionaries produced by a [`CompositeDictBuilder`].
pub struct CompositeDicts {
    composite: CompositeLookup,
    report: BuildReport,
}

impl CompositeDicts {
    /// Open a previously built pair from `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let report = BuildReport::load(dir)?;
        let shared_dict = Dict::open(dir.join(SHARED_DICT_FILE))?;
        let shared: Arc<dyn TermLookup> =
            Arc::new(SortedLookup::new(shared_dict).with_syntax(TermSyntax::SharedPart));
        let composite = CompositeLookup::new(Dict::open(dir.join(COMPOSITE_DICT_FILE))?, Some(shared))?
            .with_shared_id_limit(report.shared_id_limit);
        Ok(Self { composite, report })
    }

    /// The shared dictionary.
    pub fn shared(&self) -> &Arc<dyn TermLookup> {
        self.composite.shared()
    }

    /// The composite dictionary.
    pub fn composite(&self) -> &CompositeLookup {
        &self.composite
    }

    /// The build summary.
    pub fn report(&self) -> &BuildReport {
        &self.report
    }

    /// Id of `term`, or `NOT_FOUND`.
    pub fn find(&self, term: &[u8]) -> Result<u64> {
        self.composite.find(term)
    }

    /// Term stored under `id`.
    pub fn get(&self, id: u64) -> Result<Option<TermView<'_>>> {
        self.composite.get(id)
    }

    /// Number of terms.
    pub fn len(&self) -> u64 {
        self.composite.len()
    }

    /// Whether no terms are stored.
    pub fn is_empty(&self) -> bool {
        self.composite.is_empty()
    }

    /// Validate both dictionaries.
    pub fn validate(&self) -> Result<()> {
        self.composite.shared().validate()?;
        self.composite.validate()
    }

    /// Unmap both files. A shared dictionary still held through a clone of
    /// [`CompositeDicts::shared`] stays mapped until that clone is dropped.
    pub fn close(&mut self) {
        self.composite.close();
    }
}

enum Stage {
    Pass1 { sorter: DictSorter },
    Pass2 { shared: Arc<SortedLookup>, sorter: DictSorter, overflow: bool },
    Done,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Pass1 { .. } => "pass 1",
            Stage::Pass2 { .. } => "pass 2",
            Stage::Done => "done",
        }
    }
}

/// Builds a composite dictionary in two passes over the same terms.
///
/// Usage:
/// ```no_run
/// use termstore::builder::CompositeDictBuilder;
/// use termstore::config::CompositeOptions;
///
/// let terms: Vec<&[u8]> = vec![b"<http://ex.org/ns#a>", b"\"hi\"@en-US"];
/// let mut builder = CompositeDictBuilder::new("dicts", CompositeOptions::default()).unwrap();
/// for term in &terms {
///     builder.add_pass1(term).unwrap();
/// }
/// builder.finish_pass1().unwrap();
/// for term in &terms {
///     builder.add_pass2(term).unwrap();
/// }
/// let dicts = builder.write().unwrap();
/// assert_eq!(dicts.len(), 2);
/// ```
pub struct CompositeDictBuilder {
    dir: PathBuf,
    options: CompositeOptions,
    splitter: Splitter,
    stage: Stage,
    key: Vec<u8>,
    terms_added: u64,
    overflowed: u64,
}

impl CompositeDictBuilder {
    /// Start a build writing into `dir` (created if missing).
    pub fn new<P: AsRef<Path>>(dir: P, options: CompositeOptions) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let sorter = DictSorter::new("shared", options.sort.clone())?;
        sorter.add(b"")?;
        log::info!("Building composite dictionary in {:?}", dir);
        Ok(Self {
            dir,
            splitter: Splitter::new(options.split_mode),
            options,
            stage: Stage::Pass1 { sorter },
            key: Vec::new(),
            terms_added: 0,
            overflowed: 0,
        })
    }

    fn wrong_stage(&self, op: &str) -> Error {
        Error::invalid_state(format!("{} is not allowed in {}", op, self.stage.name()))
    }

    /// Collect the shared part of `term`.
    pub fn add_pass1(&mut self, term: &[u8]) -> Result<()> {
        let Stage::Pass1 { sorter } = &self.stage else {
            return Err(self.wrong_stage("add_pass1"));
        };
        let split = self.splitter.split(term);
        if split.side != SharedSide::None {
            sorter.add(&split.shared)?;
        }
        Ok(())
    }

    /// Write `shared.dict` and switch to pass 2.
    pub fn finish_pass1(&mut self) -> Result<()> {
        if !matches!(self.stage, Stage::Pass1 { .. }) {
            return Err(self.wrong_stage("finish_pass1"));
        }
        let Stage::Pass1 { sorter } = std::mem::replace(&mut self.stage, Stage::Done) else {
            return Err(Error::invalid_state("builder stage changed unexpectedly"));
        };

        let dict = sorter.finish(&self.dir.join(SHARED_DICT_FILE), DictFlags::empty())?;
        log::info!("Pass 1 done: {} shared parts", dict.len());
        let shared = Arc::new(SortedLookup::new(dict).with_syntax(TermSyntax::SharedPart));
        let sorter = DictSorter::new("composite", self.options.sort.clone())?;
        self.stage = Stage::Pass2 { shared, sorter, overflow: false };
        Ok(())
    }

    /// Collect the composite key of `term`.
    ///
    /// The shared part must have been seen in pass 1.
    pub fn add_pass2(&mut self, term: &[u8]) -> Result<()> {
        let limit = self.options.shared_id_limit;
        let Stage::Pass2 { shared, sorter, overflow } = &mut self.stage else {
            return Err(self.wrong_stage("add_pass2"));
        };

        let split = self.splitter.split(term);
        let code = match split.side {
            SharedSide::None => None,
            side => {
                let shared_id = shared.find(&split.shared)?;
                if shared_id == NOT_FOUND {
                    return Err(Error::invalid_state(format!(
                        "shared part {:?} was not added in pass 1",
                        String::from_utf8_lossy(&split.shared)
                    )));
                }
                if shared_id > limit {
                    *overflow = true;
                    self.overflowed += 1;
                    None
                } else {
                    Some(encode_shared_id(shared_id, side))
                }
            }
        };
        match code {
            Some(code) => composite_key(code, &split.local, &mut self.key),
            None => composite_key(
                encode_shared_id(SENTINEL_SHARED_ID, SharedSide::None),
                term,
                &mut self.key,
            ),
        }
        sorter.add(&self.key)?;
        self.terms_added += 1;
        Ok(())
    }

    /// Write `strings.dict` and `build.json`, then reopen and validate.
    pub fn write(mut self) -> Result<CompositeDicts> {
        if !matches!(self.stage, Stage::Pass2 { .. }) {
            return Err(self.wrong_stage("write"));
        }
        let Stage::Pass2 { shared, sorter, overflow } = std::mem::replace(&mut self.stage, Stage::Done)
        else {
            return Err(Error::invalid_state("builder stage changed unexpectedly"));
        };

        let flags = DictFlags::SHARED_DICT
            .with(DictFlags::SHARED_OVERFLOW, overflow)
            .with(DictFlags::PREFIX_ONLY, self.options.split_mode == SplitMode::PrefixOnly);
        let composite_path = self.dir.join(COMPOSITE_DICT_FILE);
        let dict = sorter.finish(&composite_path, flags)?;

        let shared_terms = shared.len();
        let shared: Arc<dyn TermLookup> = shared;
        let composite = CompositeLookup::new(dict, Some(shared))?
            .with_shared_id_limit(self.options.shared_id_limit);
        if self.options.validate {
            composite.shared().validate()?;
            composite.validate()?;
        }

        let report = BuildReport {
            shared_path: self.dir.join(SHARED_DICT_FILE),
            composite_path,
            shared_terms,
            composite_terms: composite.len(),
            terms_added: self.terms_added,
            overflowed: self.overflowed,
            flags: composite.flags().bits(),
            split_mode: self.options.split_mode,
            shared_id_limit: self.options.shared_id_limit,
        };
        report.store(&self.dir)?;

        log::info!(
            "Composite dictionary written: {} terms, {} shared parts, {} overflowed",
            report.composite_terms,
            report.shared_terms,
            report.overflowed
        );
        Ok(CompositeDicts { composite, report })
    }
}

/// Run both passes over `source` and write the result into `dir`.
///
/// `source` is called once per pass and must yield the same terms each time.
pub fn build<P, F, I, T>(dir: P, options: CompositeOptions, source: F) -> Result<CompositeDicts>
where
    P: AsRef<Path>,
    F: Fn() -> I,
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut builder = CompositeDictBuilder::new(dir, options)?;
    for term in source() {
        builder.add_pass1(term.as_ref())?;
    }
    builder.finish_pass1()?;
    for term in source() {
        builder.add_pass2(term.as_ref())?;
    }
    builder.write()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SortOptions;
    use crate::MIN_ID;
    use tempfile::TempDir;

    const TERMS: &[&str] = &[
        "",
        "<http://example.org/ns#Foo>",
        "<http://example.org/ns#Bar>",
        "<http://other.org/x/y>",
        "\"hello\"@en-US",
        "\"bonjour\"@en-US",
        "\"42\"^^<http://www.w3.org/2001/XMLSchema#integer>",
        "_:b0",
        "\"plain\"",
    ];

    fn check_roundtrip(dicts: &CompositeDicts) {
        for term in TERMS {
            let id = dicts.find(term.as_bytes()).unwrap();
            assert_ne!(id, NOT_FOUND, "missing {:?}", term);
            assert_eq!(dicts.get(id).unwrap().unwrap(), *term);
        }
        assert_eq!(dicts.find(b"<http://example.org/ns#Baz>").unwrap(), NOT_FOUND);
    }

    #[test]
    fn test_build_roundtrip() {
        let dir = TempDir::new().unwrap();
        let dicts = build(dir.path(), CompositeOptions::default(), || TERMS.iter().copied()).unwrap();

        assert_eq!(dicts.len(), TERMS.len() as u64);
        assert_eq!(dicts.shared().get(MIN_ID).unwrap().unwrap(), "");
        assert!(!dicts.composite().has_overflow());
        check_roundtrip(&dicts);

        let report = BuildReport::load(dir.path()).unwrap();
        assert_eq!(&report, dicts.report());
        assert_eq!(report.terms_added, TERMS.len() as u64);
    }

    #[test]
    fn test_overflow_with_small_limit() {
        let dir = TempDir::new().unwrap();
        let options = CompositeOptions::default().shared_id_limit(2);
        let dicts = build(dir.path(), options, || TERMS.iter().copied()).unwrap();

        assert!(dicts.composite().has_overflow());
        assert!(dicts.report().overflowed > 0);
        assert_eq!(dicts.composite().shared_id_limit(), 2);
        check_roundtrip(&dicts);

        let reopened = CompositeDicts::open(dir.path()).unwrap();
        assert_eq!(reopened.composite().shared_id_limit(), 2);
        check_roundtrip(&reopened);
    }

    #[test]
    fn test_prefix_only_mode() {
        let dir = TempDir::new().unwrap();
        let options = CompositeOptions::default().split_mode(SplitMode::PrefixOnly);
        let dicts = build(dir.path(), options, || TERMS.iter().copied()).unwrap();

        assert!(dicts.composite().flags().contains(DictFlags::PREFIX_ONLY));
        assert_eq!(dicts.shared().find(b"@en-US").unwrap(), NOT_FOUND);
        check_roundtrip(&dicts);
    }

    #[test]
    fn test_spilling_passes() {
        let dir = TempDir::new().unwrap();
        let sort = SortOptions::new().block_items(2).dedup_window(0);
        let options = CompositeOptions::default().sort(sort);
        let dicts = build(dir.path(), options, || TERMS.iter().copied()).unwrap();
        check_roundtrip(&dicts);
    }

    #[test]
    fn test_stage_order_enforced() {
        let dir = TempDir::new().unwrap();
        let mut builder = CompositeDictBuilder::new(dir.path(), CompositeOptions::default()).unwrap();
        assert!(matches!(builder.add_pass2(b"<a>"), Err(Error::InvalidState(_))));

        builder.add_pass1(b"<http://ex.org/a>").unwrap();
        builder.finish_pass1().unwrap();
        assert!(matches!(builder.add_pass1(b"<b>"), Err(Error::InvalidState(_))));
        assert!(matches!(builder.finish_pass1(), Err(Error::InvalidState(_))));

        let err = builder.add_pass2(b"<http://unseen.org/b>").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_reopen_from_dir() {
        let dir = TempDir::new().unwrap();
        drop(build(dir.path(), CompositeOptions::default(), || TERMS.iter().copied()).unwrap());

        let dicts = CompositeDicts::open(dir.path()).unwrap();
        dicts.validate().unwrap();
        check_roundtrip(&dicts);
    }

    #[test]
    fn test_close_unmaps_both_files() {
        let dir = TempDir::new().unwrap();
        let mut dicts = build(dir.path(), CompositeOptions::default(), || TERMS.iter().copied()).unwrap();
        dicts.close();
        assert!(dicts.composite().dict().is_closed());
        assert!(matches!(dicts.shared().get(MIN_ID), Err(Error::InvalidState(_))));
        assert!(matches!(dicts.find(b"_:b0"), Err(Error::InvalidState(_))));
        dicts.close();

        // a clone of the shared lookup keeps its file mapped
        let mut reopened = CompositeDicts::open(dir.path()).unwrap();
        let shared = Arc::clone(reopened.shared());
        reopened.close();
        assert!(reopened.composite().dict().is_closed());
        assert_eq!(shared.get(MIN_ID).unwrap().unwrap(), "");
    }
}
