//! Known submission languages, keyed by file extension.

use std::fmt;

/// Extension shared by submission archives; it never names a language.
pub const ARCHIVE_EXTENSION: &str = "zip";

#[derive(Debug, PartialEq, Eq)]
pub struct Language {
    pub name: &'static str,
    /// The first extension is the standard one.
    pub extensions: &'static [&'static str],
    pub compilable: bool,
    image_name: &'static str,
}

impl Language {
    const fn new(
        name: &'static str,
        extensions: &'static [&'static str],
        compilable: bool,
        image_name: &'static str,
    ) -> Self {
        Self {
            name,
            extensions,
            compilable,
            image_name,
        }
    }

    pub fn standard_extension(&self) -> &'static str {
        self.extensions[0]
    }

    /// Container image for this language, `{language}` in `template` being
    /// replaced by the image name.
    pub fn image(&self, template: &str) -> String {
        template.replace("{language}", self.image_name)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.extensions.join(", "))
    }
}

pub static KNOWN_LANGUAGES: &[Language] = &[
    Language::new("C", &["c", "h"], true, "c"),
    Language::new("C++", &["cpp", "cc", "cxx", "c++", "hpp", "h"], true, "cpp"),
    Language::new("C#", &["cs"], true, "dotnet"),
    Language::new("Fortran", &["f", "f90", "f95", "f15", "f03"], true, "fortran"),
    Language::new("Golang", &["go"], true, "go"),
    Language::new("Haskell", &["hs", "lhs"], true, "haskell"),
    Language::new("Java", &["java", "jar", "class"], true, "java"),
    Language::new("Octave", &["m"], false, "octave"),
    Language::new("Pascal", &["pas", "pl", "pp", "pascal"], true, "pascal"),
    Language::new("Portugol", &["por"], true, "portugol"),
    Language::new("Python", &["py", "py3", "pyc"], false, "python"),
    Language::new("R", &["r"], false, "r"),
    Language::new("Rust", &["rs"], true, "rust"),
    Language::new("Lua", &["lua", "lol", "lu", "luac"], true, "lua"),
    Language::new("Julia", &["jl", "ijl", "julia"], false, "julia"),
];

/// Looks up the language of an extension or file name.
///
/// Only the text after the last dot is considered, case-insensitively.
/// Extensions claimed by more than one language (`h`) are ambiguous and
/// yield `None`.
pub fn language_from_extension(ext_or_filename: &str) -> Option<&'static Language> {
    let ext = ext_or_filename
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_lowercase();

    let mut matches = KNOWN_LANGUAGES
        .iter()
        .filter(|lang| lang.extensions.contains(&ext.as_str()));

    match (matches.next(), matches.next()) {
        (Some(lang), None) => Some(lang),
        _ => None,
    }
}

/// Maps similar extensions onto the standard extension of their language.
///
/// `zip` is kept as is. Unknown or ambiguous extensions give `None`.
pub fn standardize_extension(raw: &str) -> Option<&'static str> {
    let ext = raw.rsplit('.').next().unwrap_or_default();
    if ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION) {
        return Some(ARCHIVE_EXTENSION);
    }
    language_from_extension(ext).map(Language::standard_extension)
}

/// Picks the dominant standardized extension among archive entry names.
///
/// Entries without an extension or with an unknown one are ignored. Ties go
/// to the extension seen first. Returns `None` if nothing was recognised.
pub fn deduce_language<'a>(entry_names: impl IntoIterator<Item = &'a str>) -> Option<&'static str> {
    let mut counts: Vec<(&'static str, usize)> = Vec::new();

    for name in entry_names {
        let Some((_, ext)) = file_stem_and_extension(name) else {
            continue;
        };
        let Some(ext) = standardize_extension(ext) else {
            continue;
        };
        match counts.iter_mut().find(|(seen, _)| *seen == ext) {
            Some((_, count)) => *count += 1,
            None => counts.push((ext, 1)),
        }
    }

    let mut best: Option<(&'static str, usize)> = None;
    for (ext, count) in counts {
        if best.is_none_or(|(_, best_count)| count > best_count) {
            best = Some((ext, count));
        }
    }
    best.map(|(ext, _)| ext)
}

pub fn language_by_name(name: &str) -> Option<&'static Language> {
    KNOWN_LANGUAGES.iter().find(|lang| lang.name == name)
}

/// Whether a standardized extension belongs to a compiled language.
pub fn is_compilable(ext: &str) -> bool {
    language_from_extension(ext).is_some_and(|lang| lang.compilable)
}

/// Splits the last path component into stem and extension. Hidden files
/// (`.profile`) have no extension.
fn file_stem_and_extension(name: &str) -> Option<(&str, &str)> {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    match file_name.rfind('.') {
        Some(0) | None => None,
        Some(idx) if idx + 1 < file_name.len() => Some((&file_name[..idx], &file_name[idx + 1..])),
        Some(_) => None,
    }
}
