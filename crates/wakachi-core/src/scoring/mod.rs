pub mod expansion;

pub use expansion::{Score, score, score_documents};
