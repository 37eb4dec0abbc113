use async_trait::async_trait;
use serde_json::Value;

use super::interceptor::InterceptorHook;
use super::request::ResourceRequest;

/// A provider serving one or more protocol names.
///
/// Errors returned here never reach the caller of the manager: they become
/// a `Failed` response whose data is the rendered error.
///
/// ```ignore
/// struct Echo(Vec<String>);
///
/// #[async_trait]
/// impl ResourceProtocol for Echo {
///     fn protocols(&self) -> &[String] {
///         &self.0
///     }
///
///     async fn request(&self, request: &ResourceRequest, _: &InterceptorHook) -> anyhow::Result<Value> {
///         Ok(Value::String(request.address().to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait ResourceProtocol: Send + Sync {
    fn protocols(&self) -> &[String];

    /// Serve a request without suspending. Providers that cannot do so keep
    /// the default, which fails.
    fn request_sync(
        &self,
        request: &ResourceRequest,
        hook: &InterceptorHook,
    ) -> anyhow::Result<Value> {
        let _ = hook;
        anyhow::bail!(
            "protocol `{}` does not support synchronous requests",
            request.protocol()
        )
    }

    async fn request(
        &self,
        request: &ResourceRequest,
        hook: &InterceptorHook,
    ) -> anyhow::Result<Value>;
}
