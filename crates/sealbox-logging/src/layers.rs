//! Custom tracing layers

use tracing::{Metadata, Subscriber, span};
use tracing_subscriber::{
    filter::{FilterFn, filter_fn},
    layer::{Context, Layer},
    registry::LookupSpan,
};

use sealbox_core::AUDIT_TARGET;

use crate::context::{PrincipalContextData, PrincipalContextGuard};

/// Layer that attaches the acting principal to new spans
///
/// When a [`PrincipalContextGuard`] is active, every span created on that
/// thread gets a [`PrincipalContextExtension`].
#[derive(Debug, Default)]
pub struct PrincipalContextLayer;

impl PrincipalContextLayer {
    /// Create a new principal context layer
    pub fn new() -> Self {
        Self
    }
}

/// Extension data stored on spans
#[derive(Debug, Clone)]
pub struct PrincipalContextExtension {
    pub data: PrincipalContextData,
}

impl<S> Layer<S> for PrincipalContextLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, _attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        if let (Some(span), Some(data)) = (ctx.span(id), PrincipalContextGuard::current()) {
            span.extensions_mut().insert(PrincipalContextExtension { data });
        }
    }
}

/// Per-layer filter passing only audit records
pub fn audit_only() -> FilterFn<fn(&Metadata<'_>) -> bool> {
    filter_fn(is_audit as fn(&Metadata<'_>) -> bool)
}

fn is_audit(metadata: &Metadata<'_>) -> bool {
    metadata.target() == AUDIT_TARGET
}
