//! Business logic services.
//!
//! Each module here owns one of the components named in §2 of the
//! system overview: the hybrid retriever (D), the auto-pin engine (E),
//! the relevance evaluator (F), the dedup engine (G), the request
//! server (H), and the extractor (J). The BM25 ranker and RRF fusion
//! are implementation details of the retriever, split into their own
//! modules because both are independently testable.

// Allow cast_precision_loss for score calculations where exact precision is not critical.
#![allow(clippy::cast_precision_loss)]
// Allow option_if_let_else for clearer code in some contexts.
#![allow(clippy::option_if_let_else)]
// Allow significant_drop_tightening as dropping slightly early provides no benefit.
#![allow(clippy::significant_drop_tightening)]
// Allow unused_self for methods kept for API consistency.
#![allow(clippy::unused_self)]
// Allow trivially_copy_pass_by_ref for namespace references.
#![allow(clippy::trivially_copy_pass_by_ref)]
// Allow unnecessary_wraps for const fn methods returning Result.
#![allow(clippy::unnecessary_wraps)]
// Allow manual_let_else for clearer error handling patterns.
#![allow(clippy::manual_let_else)]
// Allow or_fun_call for entry API with closures.
#![allow(clippy::or_fun_call)]

pub mod auto_pin;
pub mod bm25;
pub mod dedup;
pub mod evaluator;
pub mod extractor;
pub mod retriever;
pub mod rrf;
pub mod server;

pub use dedup::DedupEngine;
pub use evaluator::RelevanceEvaluator;
pub use extractor::Extractor;
pub use retriever::{HybridRetriever, build_tool_query};
pub use server::{RequestServer, ServerPaths};
