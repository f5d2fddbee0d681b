//! Free text to structured query.
//!
//! Text is normalized (lowercase, no punctuation) and matched against a fixed
//! list of English and Hinglish query shapes. Captured crop and region text is
//! canonicalized against the knowledge store where possible; unknown names
//! are passed through so the lookup can report them.

use crate::chatbot::knowledge::{KnowledgeStore, normalize};
use crate::chatbot::session::{PendingQuery, QueryKind, Session, Slot};
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropField {
    Varieties,
    Regions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedIntent {
    CropLookup { crop: String, field: CropField },
    SowingLookup { crop: String, region: String },
    /// A recognized query that still lacks `missing`; `partial` is what to store.
    Clarification { missing: Slot, partial: PendingQuery },
    Unrecognized,
    Greeting,
    Reset,
}

struct QueryShape {
    name: &'static str,
    kind: QueryKind,
    pattern: Regex,
}

const SOW_WORDS: &str = "sowing|planting|seeding|buvai|buwai|bowai|bijai|buai";
const TIME_WORDS: &str = "time|times|date|dates|season|window|period|schedule|month";
const VARIETY_WORDS: &str = "varieties|variety|varities|verities|types|kinds|seeds|seed varieties|cultivars";
const HI_OF: &str = "ki|ka|ke|की|का|के";
const HI_IN: &str = "mein|me|main|mai|में";
const HI_SOW: &str = "buvai|buwai|bowai|bijai|buai|sowing|बुवाई|बोवाई";
const HI_VARIETY: &str =
    "kisme|kismen|kismein|kism|kisam|prajati|prajatiyan|prajatiya|varieties|variety|किस्में|किस्म|प्रजाति|प्रजातियां|प्रजातियाँ";
const REGION_WORDS: &str = "regions?|states?|areas?|zones?|places?";

/// Shapes in match order. Region-first Hinglish must precede crop-first.
fn shapes() -> Vec<QueryShape> {
    let shape = |name, kind, pattern: String| QueryShape {
        name,
        kind,
        pattern: Regex::new(&pattern).expect("valid query shape"),
    };
    use QueryKind::*;
    vec![
        shape(
            "sowing-time-for",
            SowingTime,
            format!(
                r"^(?:when is (?:the )?)?(?:best |right |correct |ideal )?(?:{SOW_WORDS}) (?:{TIME_WORDS})(?: (?:for |of )?(?P<crop>.+?))?(?: (?:in|for) (?P<region>.+?))?$"
            ),
        ),
        shape(
            "crop-sowing-time",
            SowingTime,
            format!(r"^(?P<crop>.+?) (?:{SOW_WORDS}) (?:{TIME_WORDS})(?: (?:in|for) (?P<region>.+?))?$"),
        ),
        shape(
            "when-to-sow",
            SowingTime,
            r"^(?:when|what time|best time) (?:to|should i|should we|do i|do we|can i|is it best to|is best to) (?:sow|plant|seed)(?: (?P<crop>.+?))?(?: (?:in|for) (?P<region>.+?))?$".to_string(),
        ),
        shape(
            "hi-region-crop-buvai",
            SowingTime,
            format!(r"^(?P<region>.+?) (?:{HI_IN}) (?P<crop>.+?) (?:{HI_OF}) (?:{HI_SOW})(?: .*)?$"),
        ),
        shape(
            "hi-crop-buvai",
            SowingTime,
            format!(
                r"^(?P<crop>.+?) (?:{HI_OF}) (?:{HI_SOW})(?: (?:{HI_OF}))?(?: (?:samay|samy|time|kab|समय|कब))?(?: (?P<region>.+?) (?:{HI_IN}))?(?: (?:kab|kare|karein|karen|karni|chahiye|कब|करें))*$"
            ),
        ),
        shape(
            "varieties-of",
            Varieties,
            format!(
                r"^(?:best |good |improved |recommended |top |high yielding |popular )?(?:{VARIETY_WORDS})(?: (?:of|for) (?P<crop>.+?))?$"
            ),
        ),
        shape(
            "which-varieties",
            Varieties,
            format!(
                r"^(?:which|what) (?:{VARIETY_WORDS})(?: (?:of|for) (?P<crop>.+?))?(?: (?:should|can|do) (?:i|we) (?:sow|plant|grow))?$"
            ),
        ),
        shape(
            "hi-crop-kisme",
            Varieties,
            format!(r"^(?P<crop>.+?) (?:{HI_OF}) (?:{HI_VARIETY})(?: .*)?$"),
        ),
        shape(
            "crop-varieties",
            Varieties,
            format!(r"^(?P<crop>.+?) (?:{VARIETY_WORDS})(?: (?:list|available|names))?$"),
        ),
        shape(
            "where-grown",
            Regions,
            format!(
                r"^(?:where|which (?:{REGION_WORDS})|in which (?:{REGION_WORDS})) (?:is |are |can |do |does |to )?(?:i |we |you |farmers )?(?:grow |grows |sow |sows |plant |cultivate )?(?P<crop>.+?)(?: (?:grown|sown|planted|cultivated|be grown|grow))?$"
            ),
        ),
        shape(
            "regions-of",
            Regions,
            r"^(?:which |what )?(?:regions|growing regions|sowing regions|growing areas|states)(?: (?:for|of) (?P<crop>.+?))?$".to_string(),
        ),
        shape(
            "crop-regions",
            Regions,
            r"^(?P<crop>.+?) (?:regions|growing regions|sowing regions|growing areas|states)$".to_string(),
        ),
        shape(
            "hi-crop-kahan",
            Regions,
            r"^(?P<crop>.+?) (?:kahan|kaha|kahaan|कहाँ|कहां) (?:ugaya|ugai|ugate|ugta|ugti|boya|boyi|hota|hoti|ugaai)(?: .*)?$".to_string(),
        ),
    ]
}

/// Maps user text to an intent, using the session for context.
pub struct IntentResolver {
    knowledge: Arc<KnowledgeStore>,
    shapes: Vec<QueryShape>,
    greeting: Regex,
    reset: Regex,
    leading_filler: Regex,
    trailing_filler: Regex,
    bare_pair: Regex,
}

impl IntentResolver {
    pub fn new(knowledge: Arc<KnowledgeStore>) -> Self {
        Self {
            knowledge,
            shapes: shapes(),
            greeting: Regex::new(
                r"^(?:hi+|hello|helo|hey|namaste|namaskar|ram ram|good (?:morning|afternoon|evening)|start|help|menu|नमस्ते|नमस्कार)(?: (?:there|bot|ji|sir|bhai))?$",
            )
            .expect("valid pattern"),
            reset: Regex::new(
                r"^(?:reset|cancel|start over|start again|restart|clear|new question|stop|band karo|रद्द करें|रद्द)$",
            )
            .expect("valid pattern"),
            leading_filler: Regex::new(
                r"^(?:(?:please|pls|plz|kindly|hi|hello|hey|namaste|ok|okay|and|also|then|tell me about|tell me|can you tell me|could you tell me|i want to know|i need to know|show me|give me|list of|list|what is|what are|whats|what s|about|the)\s+)+",
            )
            .expect("valid pattern"),
            trailing_filler: Regex::new(
                r"(?:\s+(?:please|pls|plz|batao|bataiye|bataye|bataen|kya hai|kya h|hai|bhai|sir|ji|बताइए|बताओ|है))+$",
            )
            .expect("valid pattern"),
            bare_pair: Regex::new(r"^(?P<crop>.+?) (?:in|for|mein|me|main|में) (?P<region>.+)$").expect("valid pattern"),
        }
    }

    pub fn resolve(&self, text: &str, session: &Session) -> ResolvedIntent {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return ResolvedIntent::Unrecognized;
        }
        if self.greeting.is_match(&normalized) {
            return ResolvedIntent::Greeting;
        }

        let stripped = self.strip_filler(&normalized);
        if self.reset.is_match(&stripped) {
            return ResolvedIntent::Reset;
        }

        let pending = session.pending_query.as_ref();
        if let Some(mut query) = self.match_shape(&stripped) {
            if let Some(earlier) = pending {
                query.merge_from(earlier);
            }
            return self.finish(query);
        }

        match pending {
            Some(earlier) => self.fill_from_bare_value(&stripped, earlier),
            None => ResolvedIntent::Unrecognized,
        }
    }

    fn strip_filler(&self, text: &str) -> String {
        let text = self.leading_filler.replace(text, "");
        self.trailing_filler.replace(&text, "").trim().to_string()
    }

    fn match_shape(&self, text: &str) -> Option<PendingQuery> {
        for shape in &self.shapes {
            let Some(caps) = shape.pattern.captures(text) else {
                continue;
            };
            let mut crop = caps.name("crop").map(|m| clean_crop(m.as_str())).filter(|c| !c.is_empty());
            let mut region = caps.name("region").map(|m| clean_region(m.as_str())).filter(|r| !r.is_empty());

            // "sowing time in punjab": the crop slot caught the region.
            if let Some(rest) = crop.as_deref().and_then(|c| c.strip_prefix("in ")) {
                if region.is_none() {
                    region = Some(clean_region(rest));
                }
                crop = None;
            }

            debug!("Matched shape {} (crop={:?}, region={:?})", shape.name, crop, region);
            let mut query = PendingQuery::new(shape.kind);
            query.crop = crop.map(|c| self.canonical_crop(&c));
            if shape.kind == QueryKind::SowingTime {
                query.region = region.map(|r| self.canonical_region(&r));
            }
            return Some(query);
        }
        None
    }

    /// A reply like "wheat" or "north" to an earlier clarification question.
    fn fill_from_bare_value(&self, text: &str, earlier: &PendingQuery) -> ResolvedIntent {
        let mut query = earlier.clone();
        let mut filled = false;

        if let Some(caps) = self.bare_pair.captures(text) {
            let crop = self.knowledge.find_crop_in(&caps["crop"]);
            let region = self.knowledge.find_region(&clean_region(&caps["region"]));
            if let Some(crop) = crop {
                // A crop named in the text replaces the pending one.
                query.crop = Some(crop);
                filled = true;
                if let (QueryKind::SowingTime, Some(region)) = (query.kind, region) {
                    query.region = Some(region);
                    filled = true;
                }
            }
        }

        if !filled {
            match earlier.missing() {
                Some(Slot::Crop) => {
                    if let Some(crop) = self.knowledge.find_crop_in(text) {
                        query.crop = Some(crop);
                        filled = true;
                    } else if let (QueryKind::SowingTime, Some(region)) =
                        (query.kind, self.knowledge.find_region(&clean_region(text)))
                    {
                        query.region = Some(region);
                        filled = true;
                    }
                }
                Some(Slot::Region) => {
                    if let Some(region) = self.knowledge.find_region(&clean_region(text)) {
                        query.region = Some(region);
                        filled = true;
                    } else if let Some(crop) = self.knowledge.find_crop_in(text) {
                        // A different crop for the same question.
                        query.crop = Some(crop);
                        filled = true;
                    }
                }
                None => {}
            }
        }

        if !filled {
            return ResolvedIntent::Unrecognized;
        }
        debug!("Filled pending {:?} from bare value {:?}", query.kind, text);
        self.finish(query)
    }

    fn finish(&self, query: PendingQuery) -> ResolvedIntent {
        if let Some(missing) = query.missing() {
            return ResolvedIntent::Clarification { missing, partial: query };
        }
        let crop = query.crop.unwrap_or_default();
        match query.kind {
            QueryKind::Varieties => ResolvedIntent::CropLookup { crop, field: CropField::Varieties },
            QueryKind::Regions => ResolvedIntent::CropLookup { crop, field: CropField::Regions },
            QueryKind::SowingTime => ResolvedIntent::SowingLookup {
                crop,
                region: query.region.unwrap_or_default(),
            },
        }
    }

    fn canonical_crop(&self, text: &str) -> String {
        self.knowledge.find_crop_in(text).unwrap_or_else(|| text.to_string())
    }

    fn canonical_region(&self, text: &str) -> String {
        self.knowledge.find_region(text).unwrap_or_else(|| text.to_string())
    }
}

fn clean_crop(text: &str) -> String {
    const PREFIXES: [&str; 3] = ["the ", "a ", "my "];
    const SUFFIXES: [&str; 8] = [" crop", " fasal", " ki", " ka", " ke", " की", " का", " फसल"];
    strip_words(text, &PREFIXES, &SUFFIXES)
}

fn clean_region(text: &str) -> String {
    const PREFIXES: [&str; 1] = ["the "];
    const SUFFIXES: [&str; 9] =
        [" region", " area", " zone", " district", " state", " belt", " mein", " me", " में"];
    strip_words(text, &PREFIXES, &SUFFIXES)
}

fn strip_words(text: &str, prefixes: &[&str], suffixes: &[&str]) -> String {
    let mut s = text.trim();
    loop {
        let before = s;
        for p in prefixes {
            s = s.strip_prefix(p).unwrap_or(s);
        }
        for x in suffixes {
            s = s.strip_suffix(x).unwrap_or(s);
        }
        if s == before {
            return s.trim().to_string();
        }
    }
}
