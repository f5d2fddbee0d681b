//! Reply texts sent back to the farmer.

use crate::chatbot::knowledge::{Answer, CropRecord, FieldValue, NotFound};
use crate::chatbot::session::{PendingQuery, QueryKind, Slot};

pub fn welcome() -> String {
    format!(
        "Namaste! I can tell you about crop varieties and sowing times.\n\
         नमस्ते! मैं फसलों की किस्में और बुवाई का समय बता सकता हूँ।\n\n{}",
        help()
    )
}

pub fn help() -> String {
    "Try asking:\n\
     - varieties of wheat\n\
     - sowing time for wheat in north\n\
     - which regions grow bajra\n\
     - gehu ki buvai ka samay punjab mein\n\
     Send \"reset\" to start over."
        .to_string()
}

/// Help text, reminding the user of any question still open.
pub fn unrecognized(pending: Option<&PendingQuery>) -> String {
    let mut reply = format!("Sorry, I did not understand that.\n\n{}", help());
    if let Some(query) = pending {
        if let Some(slot) = query.missing() {
            reply.push_str(&format!("\n\nStill waiting for the {} for your {} question.", slot, kind_label(query.kind)));
        }
    }
    reply
}

pub fn ask_for(slot: Slot, query: &PendingQuery, crop: Option<&CropRecord>) -> String {
    match slot {
        Slot::Crop => format!("Which crop do you want {} for?", kind_label(query.kind)),
        Slot::Region => {
            let name = crop.map(|c| c.name.as_str()).or(query.crop.as_deref()).unwrap_or("this crop");
            match crop.filter(|c| !c.sowing.is_empty()) {
                Some(c) => format!(
                    "Which region are you in? I have {} sowing times for: {}.",
                    name,
                    c.sowing.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
                None => format!("Which region are you in? (for {} sowing time)", name),
            }
        }
    }
}

pub fn answer(answer: &Answer) -> String {
    match &answer.value {
        FieldValue::Varieties(varieties) => {
            let mut reply = format!("Varieties of {}:", answer.crop);
            for v in varieties {
                reply.push_str(&format!("\n- {}", v.name));
                if let Some(time) = &v.sowing_time {
                    reply.push_str(&format!(" (sow {})", time));
                }
                if let Some(description) = &v.description {
                    reply.push_str(&format!(": {}", description));
                }
            }
            reply
        }
        FieldValue::Regions(regions) => {
            format!("{} sowing data is available for: {}.", answer.crop, regions.join(", "))
        }
        FieldValue::SowingWindow { region, window } => {
            format!("Sowing time for {} in {}: {}", answer.crop, region, window)
        }
    }
}

pub fn not_found(err: &NotFound) -> String {
    match err {
        NotFound::Crop(name) => format!("Sorry, I have no data for \"{}\".", name),
        NotFound::Ambiguous { query, candidates } => format!(
            "Sorry, I have no data for \"{}\". Did you mean {}?",
            query,
            candidates.join(" or ")
        ),
        NotFound::Region { crop, region } => {
            format!("Sorry, I have no sowing data for {} in {}.", crop, region)
        }
        NotFound::NoData { crop, field } => format!("Sorry, I have no {} data for {}.", field, crop),
    }
}

pub fn audio_failed() -> String {
    "Sorry, I could not understand the audio. Please type your question.\n\
     माफ़ कीजिए, आवाज़ समझ नहीं आई। कृपया अपना सवाल लिखकर भेजें।"
        .to_string()
}

pub fn busy() -> String {
    "I am still working on your last message. Please wait a moment and try again.".to_string()
}

pub fn reset_done() -> String {
    "Okay, let's start over. What would you like to know?".to_string()
}

pub fn storage_failed() -> String {
    "Sorry, something went wrong on our side. Please try again.".to_string()
}

fn kind_label(kind: QueryKind) -> &'static str {
    match kind {
        QueryKind::Varieties => "varieties",
        QueryKind::Regions => "growing regions",
        QueryKind::SowingTime => "sowing time",
    }
}
