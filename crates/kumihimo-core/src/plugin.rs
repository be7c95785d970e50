//! Reusable workflow extensions.

use crate::error::WorkflowError;
use crate::workflow::Workflow;
use std::fmt;
use std::sync::Arc;

type PluginBody<O> = Arc<dyn Fn(&Workflow, O) -> anyhow::Result<()> + Send + Sync>;

/// A reusable function extending a workflow scope with steps, hooks and decorators.
///
/// The body runs once, during [`Workflow::ready`], against the child
/// scope created when the plugin was registered.
///
/// # Examples
///
/// ```
/// use kumihimo_core::{Plugin, Step, Workflow};
///
/// let audit = Plugin::new("audit", |scope: &Workflow, prefix: String| {
///     scope.decorate("audit-prefix", prefix)?;
///     scope.step(Step::new("audit", |ctx| async move { Ok(ctx.state) }));
///     Ok(())
/// });
///
/// let workflow = Workflow::new("orders");
/// workflow.register(audit, "orders:".to_string());
/// let workflow = workflow.ready().expect("valid workflow");
/// assert!(workflow.has_step("audit"));
/// ```
pub struct Plugin<O = ()> {
    name: String,
    dependencies: Vec<String>,
    share_decorators: bool,
    body: PluginBody<O>,
}

impl<O> Clone for Plugin<O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            dependencies: self.dependencies.clone(),
            share_decorators: self.share_decorators,
            body: Arc::clone(&self.body),
        }
    }
}

impl<O> fmt::Debug for Plugin<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("share_decorators", &self.share_decorators)
            .finish()
    }
}

impl<O> Plugin<O> {
    /// Creates a plugin named `name` running `body`.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Workflow, O) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            share_decorators: false,
            body: Arc::new(body),
        }
    }

    /// Requires `plugin` to be registered before this one.
    #[must_use]
    pub fn depends_on(mut self, plugin: impl Into<String>) -> Self {
        self.dependencies.push(plugin.into());
        self
    }

    /// Attaches decorators declared by the body to the registering scope
    /// instead of the plugin's own scope, making them visible to later siblings.
    #[must_use]
    pub fn share_decorators(mut self) -> Self {
        self.share_decorators = true;
        self
    }

    /// Returns the plugin name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the names of the plugins this one depends on.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Returns `true` if decorators land on the registering scope.
    pub fn shares_decorators(&self) -> bool {
        self.share_decorators
    }
}

/// Options handed to a plugin body.
pub enum PluginOptions<O> {
    /// A literal value, cloned for the body.
    Value(O),
    /// Computed from the plugin's scope when the body runs, so it can
    /// read decorators declared earlier.
    Factory(Arc<dyn Fn(&Workflow) -> O + Send + Sync>),
}

impl<O> PluginOptions<O> {
    /// Options computed from the plugin scope at readiness time.
    pub fn factory<F>(f: F) -> Self
    where
        F: Fn(&Workflow) -> O + Send + Sync + 'static,
    {
        PluginOptions::Factory(Arc::new(f))
    }
}

impl<O> From<O> for PluginOptions<O> {
    fn from(value: O) -> Self {
        PluginOptions::Value(value)
    }
}

/// A plugin paired with its options, with the option type erased.
pub(crate) trait RegisteredPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn dependencies(&self) -> &[String];
    fn shares_decorators(&self) -> bool;
    fn apply(&self, scope: &Workflow) -> Result<(), WorkflowError>;
}

pub(crate) struct Registration<O> {
    plugin: Plugin<O>,
    options: PluginOptions<O>,
}

impl<O> Registration<O> {
    pub(crate) fn new(plugin: Plugin<O>, options: PluginOptions<O>) -> Self {
        Self { plugin, options }
    }
}

impl<O> RegisteredPlugin for Registration<O>
where
    O: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.plugin.name
    }

    fn dependencies(&self) -> &[String] {
        &self.plugin.dependencies
    }

    fn shares_decorators(&self) -> bool {
        self.plugin.share_decorators
    }

    fn apply(&self, scope: &Workflow) -> Result<(), WorkflowError> {
        let options = match &self.options {
            PluginOptions::Value(value) => value.clone(),
            PluginOptions::Factory(f) => f(scope),
        };
        (self.plugin.body)(scope, options).map_err(|err| match err.downcast::<WorkflowError>() {
            Ok(err) => err,
            Err(err) => WorkflowError::Plugin {
                plugin: self.plugin.name.clone(),
                details: err.to_string(),
            },
        })
    }
}
