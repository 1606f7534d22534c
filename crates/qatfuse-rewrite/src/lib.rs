//! Subgraph rewriting for qatfuse graphs.
//!
//! [`SubgraphMatcher`] finds structural occurrences of a pattern graph,
//! [`MatchFilter`]s accept or reject them, and
//! [`replace_pattern_with_filters`] splices in a replacement graph for each
//! accepted occurrence.

mod error;
pub mod filter;
pub mod matcher;
pub mod rewriter;

pub use error::{FilterError, RewriteError};
pub use filter::{
    MatchFilter, accept_all, bn_has_scale_inputs, conv_not_transposed, has_conv_bias, no_conv_bias,
};
pub use matcher::{InternalMatch, MatcherOptions, SubgraphMatcher};
pub use rewriter::{OriginalNode, ReplacedPattern, replace_pattern_with_filters, rewrite};
