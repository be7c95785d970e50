//! Workflow definition model.
//!
//! A workflow is a graph of step, hook and plugin nodes kept in declaration
//! order in a single [`AppendList`]. Every [`Workflow`] value is a cheap
//! handle onto one scope of that graph: the root scope, or the child scope
//! of a registered plugin. Plugin scopes write through a [`Slice`] of the
//! shared list, so they extend only their own region.

use crate::decorator::{DecoratorKey, Decorators};
use crate::error::WorkflowError;
use crate::hook::{
    Hook, HookPoint, StepErrorEvent, StepEvent, WorkflowCompletedEvent, WorkflowFailedEvent,
    WorkflowStoppedEvent,
};
use crate::list::{AppendList, OrderedList, Slice};
use crate::plugin::{Plugin, PluginOptions, RegisteredPlugin, Registration};
use crate::step::{Step, StepName};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

type NodeId = u64;
type ContextId = usize;

const ROOT: ContextId = 0;

#[derive(Clone)]
enum Node {
    Step {
        id: NodeId,
        step: Step,
        context: ContextId,
    },
    Hook {
        id: NodeId,
        hook: Hook,
        context: ContextId,
    },
    Plugin {
        id: NodeId,
        plugin: Arc<dyn RegisteredPlugin>,
        context: ContextId,
        child: ContextId,
    },
}

impl Node {
    fn id(&self) -> NodeId {
        match self {
            Node::Step { id, .. } | Node::Hook { id, .. } | Node::Plugin { id, .. } => *id,
        }
    }
}

struct ContextData {
    parent: Option<ContextId>,
    /// Plugin node whose region this context owns.
    anchor: Option<NodeId>,
    /// Elements inside the region, including nested regions.
    len: usize,
    decorators: Decorators,
    /// Context whose decorator set `decorate` writes into.
    decorator_owner: ContextId,
    ready: bool,
}

impl ContextData {
    fn root() -> Self {
        Self {
            parent: None,
            anchor: None,
            len: 0,
            decorators: Decorators::new(),
            decorator_owner: ROOT,
            ready: false,
        }
    }
}

struct Graph {
    name: String,
    nodes: AppendList<Node>,
    contexts: Vec<ContextData>,
    next_id: NodeId,
    ready: bool,
    late: Vec<WorkflowError>,
}

impl Graph {
    fn new(name: String) -> Self {
        Self {
            name,
            nodes: AppendList::new(),
            contexts: vec![ContextData::root()],
            next_id: 0,
            ready: false,
            late: Vec::new(),
        }
    }

    fn allocate_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn position(&self, id: NodeId) -> Option<usize> {
        self.nodes.as_slice().iter().position(|node| node.id() == id)
    }

    fn region_start(&self, context: ContextId) -> usize {
        self.contexts[context]
            .anchor
            .and_then(|anchor| self.position(anchor))
            .map_or(0, |position| position + 1)
    }

    fn region_len(&self, context: ContextId) -> usize {
        if context == ROOT {
            self.nodes.len()
        } else {
            self.contexts[context].len
        }
    }

    /// Contexts from the outermost plugin scope down to `context`, root excluded.
    fn scope_chain(&self, context: ContextId) -> Vec<ContextId> {
        let mut chain = Vec::new();
        let mut current = context;
        while let Some(parent) = self.contexts[current].parent {
            chain.push(current);
            current = parent;
        }
        chain.reverse();
        chain
    }

    fn append(&mut self, context: ContextId, node: Node) {
        let chain = self.scope_chain(context);
        let regions: Vec<(usize, usize)> = chain
            .iter()
            .map(|&scope| {
                let parent = self.contexts[scope].parent.unwrap_or(ROOT);
                let start = self.region_start(scope) - self.region_start(parent);
                (start, self.contexts[scope].len)
            })
            .collect();

        let mut lens = Vec::with_capacity(regions.len());
        append_through(&mut self.nodes, &regions, node, &mut lens);

        // `lens` is innermost first.
        for (scope, len) in chain.iter().rev().zip(lens) {
            self.contexts[*scope].len = len;
        }
    }

    /// Allocates a node id, or records a late declaration once the graph is frozen.
    fn declare(&mut self, what: impl FnOnce() -> String) -> Option<NodeId> {
        if self.ready {
            let err = WorkflowError::DeclaredAfterReady(what());
            warn!(workflow = %self.name, "{}", err);
            self.late.push(err);
            return None;
        }
        Some(self.allocate_id())
    }

    /// Names of plugins registered before `node`, walking out from its scope.
    fn plugins_registered_before(&mut self, context: ContextId, node: NodeId) -> HashSet<String> {
        let mut names = HashSet::new();
        let mut scope = context;
        let mut position = self.position(node);

        loop {
            let start = self.region_start(scope);
            let len = self.region_len(scope);
            if let Some(from) = position.and_then(|p| p.checked_sub(start + 1)) {
                let region = Slice::resume(&mut self.nodes, start, len);
                for earlier in region.reverse_iter_from(from) {
                    if let Node::Plugin { plugin, .. } = earlier {
                        names.insert(plugin.name().to_string());
                    }
                }
            }

            let Some(parent) = self.contexts[scope].parent else {
                break;
            };
            // The anchoring plugin itself counts as registered before.
            position = self.contexts[scope]
                .anchor
                .and_then(|anchor| self.position(anchor))
                .map(|p| p + 1);
            scope = parent;
        }
        names
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        let mut seen = HashSet::new();
        for node in self.nodes.as_slice() {
            if let Node::Step { step, .. } = node {
                if !seen.insert(step.name().clone()) {
                    return Err(WorkflowError::DuplicateStep(step.name().clone()));
                }
                if step.attempt_limit() == 0 {
                    return Err(WorkflowError::Configuration(format!(
                        "step '{}' must allow at least one attempt",
                        step.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

fn append_through(
    list: &mut dyn OrderedList<Node>,
    regions: &[(usize, usize)],
    node: Node,
    lens: &mut Vec<usize>,
) {
    match regions.split_first() {
        None => {
            list.append(node);
        }
        Some((&(start, len), inner)) => {
            let mut slice = Slice::resume(list, start, len);
            append_through(&mut slice, inner, node, lens);
            lens.push(slice.len());
        }
    }
}

/// A handle onto one scope of a workflow definition.
///
/// Cloning is cheap; all clones share the same graph. Declaration methods
/// return the handle so calls can be chained, and [`Workflow::register`]
/// returns the plugin's child scope so chained declarations land inside it.
///
/// # Examples
///
/// ```
/// use kumihimo_core::{Step, Workflow};
/// use serde_json::json;
///
/// let workflow = Workflow::new("checkout")
///     .step(Step::new("charge-card", |ctx| async move { Ok(ctx.state) }))
///     .step(Step::new("send-email", |_ctx| async move { Ok(json!("sent")) }))
///     .ready()
///     .expect("valid workflow");
///
/// let first = workflow.get_first_step().expect("has steps");
/// assert_eq!(first.name().as_str(), "charge-card");
/// ```
#[derive(Clone)]
pub struct Workflow {
    graph: Arc<RwLock<Graph>>,
    /// Held for a whole readiness pass so plugin bodies run once.
    expansion: Arc<Mutex<()>>,
    context: ContextId,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let graph = self.graph.read();
        f.debug_struct("Workflow")
            .field("name", &graph.name)
            .field("context", &self.context)
            .field("nodes", &graph.nodes.len())
            .field("ready", &graph.ready)
            .finish()
    }
}

impl Workflow {
    /// Creates an empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            graph: Arc::new(RwLock::new(Graph::new(name.into()))),
            expansion: Arc::new(Mutex::new(())),
            context: ROOT,
        }
    }

    fn scope(&self, context: ContextId) -> Self {
        Self {
            graph: Arc::clone(&self.graph),
            expansion: Arc::clone(&self.expansion),
            context,
        }
    }

    /// Returns the handle onto the root scope.
    pub fn root(&self) -> Self {
        self.scope(ROOT)
    }

    /// Returns `true` if this handle points at the root scope.
    pub fn is_root(&self) -> bool {
        self.context == ROOT
    }

    /// Returns the workflow name.
    pub fn name(&self) -> String {
        self.graph.read().name.clone()
    }

    /// Returns `true` once [`Workflow::ready`] succeeded.
    pub fn is_ready(&self) -> bool {
        self.graph.read().ready
    }

    /// Appends a step to this scope.
    pub fn step(&self, step: Step) -> Self {
        let mut graph = self.graph.write();
        if let Some(id) = graph.declare(|| format!("step '{}'", step.name())) {
            let context = self.context;
            graph.append(context, Node::Step { id, step, context });
        }
        self.clone()
    }

    /// Appends a lifecycle hook to this scope.
    ///
    /// The hook runs with this scope as its context, so it sees the
    /// decorators visible here.
    pub fn add_hook(&self, hook: Hook) -> Self {
        let mut graph = self.graph.write();
        if let Some(id) = graph.declare(|| format!("hook '{}'", hook.kind())) {
            let context = self.context;
            graph.append(context, Node::Hook { id, hook, context });
        }
        self.clone()
    }

    /// Appends an `onStepCompleted` hook.
    pub fn on_step_completed<F, Fut>(&self, f: F) -> Self
    where
        F: Fn(StepEvent, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_hook(Hook::on_step_completed(f))
    }

    /// Appends an `onStepError` hook.
    pub fn on_step_error<F, Fut>(&self, f: F) -> Self
    where
        F: Fn(StepErrorEvent, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_hook(Hook::on_step_error(f))
    }

    /// Appends an `onStepSkipped` hook.
    pub fn on_step_skipped<F, Fut>(&self, f: F) -> Self
    where
        F: Fn(StepEvent, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_hook(Hook::on_step_skipped(f))
    }

    /// Appends an `onWorkflowCompleted` hook.
    pub fn on_workflow_completed<F, Fut>(&self, f: F) -> Self
    where
        F: Fn(WorkflowCompletedEvent, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_hook(Hook::on_workflow_completed(f))
    }

    /// Appends an `onWorkflowFailed` hook.
    pub fn on_workflow_failed<F, Fut>(&self, f: F) -> Self
    where
        F: Fn(WorkflowFailedEvent, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_hook(Hook::on_workflow_failed(f))
    }

    /// Appends an `onWorkflowStopped` hook.
    pub fn on_workflow_stopped<F, Fut>(&self, f: F) -> Self
    where
        F: Fn(WorkflowStoppedEvent, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_hook(Hook::on_workflow_stopped(f))
    }

    /// Attaches a named value to this scope.
    ///
    /// Fails if `key` was already decorated on this exact scope; ancestors
    /// may declare the same key.
    pub fn decorate<T: Any + Send + Sync>(
        &self,
        key: impl Into<DecoratorKey>,
        value: T,
    ) -> Result<Self, WorkflowError> {
        let key = key.into();
        let mut graph = self.graph.write();
        if graph.ready {
            return Err(WorkflowError::DeclaredAfterReady(format!(
                "decorator '{}'",
                key
            )));
        }
        let owner = graph.contexts[self.context].decorator_owner;
        if !graph.contexts[owner]
            .decorators
            .try_insert(key.clone(), value)
        {
            return Err(WorkflowError::DuplicateDecorator(key));
        }
        Ok(self.clone())
    }

    /// Resolves a decorator visible from this scope, walking up through ancestors.
    pub fn decorator<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let graph = self.graph.read();
        let mut current = Some(self.context);
        while let Some(context) = current {
            let data = &graph.contexts[context];
            if data.decorators.contains_key(key) {
                return data.decorators.get::<T>(key);
            }
            current = data.parent;
        }
        None
    }

    /// Returns `true` if `key` resolves from this scope.
    pub fn has_decorator(&self, key: &str) -> bool {
        let graph = self.graph.read();
        let mut current = Some(self.context);
        while let Some(context) = current {
            let data = &graph.contexts[context];
            if data.decorators.contains_key(key) {
                return true;
            }
            current = data.parent;
        }
        false
    }

    /// Registers a plugin and returns its child scope.
    ///
    /// The plugin body runs during [`Workflow::ready`]. Declarations chained
    /// on the returned scope land in the plugin's region, ahead of whatever
    /// the body declares.
    pub fn register<O>(&self, plugin: Plugin<O>, options: impl Into<PluginOptions<O>>) -> Self
    where
        O: Clone + Send + Sync + 'static,
    {
        let mut graph = self.graph.write();
        let Some(id) = graph.declare(|| format!("plugin '{}'", plugin.name()))
        else {
            return self.clone();
        };

        let child = graph.contexts.len();
        let decorator_owner = if plugin.shares_decorators() {
            graph.contexts[self.context].decorator_owner
        } else {
            child
        };
        graph.contexts.push(ContextData {
            parent: Some(self.context),
            anchor: Some(id),
            len: 0,
            decorators: Decorators::new(),
            decorator_owner,
            ready: false,
        });

        let context = self.context;
        let plugin: Arc<dyn RegisteredPlugin> =
            Arc::new(Registration::new(plugin, options.into()));
        graph.append(
            context,
            Node::Plugin {
                id,
                plugin,
                context,
                child,
            },
        );
        self.scope(child)
    }

    /// Expands plugins, checks their dependencies and freezes the graph.
    ///
    /// Idempotent: once ready, further calls return immediately (unless
    /// something was declared after readiness, which is reported every time).
    pub fn ready(&self) -> Result<Self, WorkflowError> {
        if let Some(done) = self.readiness() {
            return done;
        }
        let _expanding = self.expansion.lock();
        if let Some(done) = self.readiness() {
            return done;
        }

        let mut visited = HashSet::new();
        let mut index = 0;
        loop {
            let pending = {
                let mut graph = self.graph.write();
                let Some(node) = graph.nodes.at(index).cloned() else {
                    break;
                };
                index += 1;
                if !visited.insert(node.id()) {
                    continue;
                }
                let Node::Plugin {
                    id,
                    plugin,
                    context,
                    child,
                } = node
                else {
                    continue;
                };
                if graph.contexts[child].ready {
                    continue;
                }

                let registered = graph.plugins_registered_before(context, id);
                let missing: Vec<String> = plugin
                    .dependencies()
                    .iter()
                    .filter(|dep| !registered.contains(dep.as_str()))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(WorkflowError::UnsatisfiedDependencies {
                        plugin: plugin.name().to_string(),
                        missing,
                    });
                }
                (plugin, child)
            };

            let (plugin, child) = pending;
            debug!(plugin = plugin.name(), "Expanding plugin");
            plugin.apply(&self.scope(child))?;
            self.graph.write().contexts[child].ready = true;
        }

        let mut graph = self.graph.write();
        graph.validate()?;
        graph.contexts[ROOT].ready = true;
        graph.ready = true;
        debug!(workflow = %graph.name, nodes = graph.nodes.len(), "Workflow ready");
        Ok(self.root())
    }

    fn readiness(&self) -> Option<Result<Self, WorkflowError>> {
        let graph = self.graph.read();
        if let Some(err) = graph.late.first() {
            return Some(Err(err.clone()));
        }
        graph.ready.then(|| Ok(self.root()))
    }

    /// Returns every step with the scope it was declared in, in declaration order.
    pub fn steps(&self) -> Vec<(Step, Workflow)> {
        let graph = self.graph.read();
        graph
            .nodes
            .as_slice()
            .iter()
            .filter_map(|node| match node {
                Node::Step { step, context, .. } => Some((step.clone(), self.scope(*context))),
                _ => None,
            })
            .collect()
    }

    /// Returns every step name in declaration order.
    pub fn step_names(&self) -> Vec<StepName> {
        self.steps()
            .into_iter()
            .map(|(step, _)| step.name().clone())
            .collect()
    }

    /// Returns `true` if a step named `name` exists.
    pub fn has_step(&self, name: &str) -> bool {
        self.get_step_by_name(name).is_some()
    }

    /// Returns the number of declared steps.
    pub fn step_count(&self) -> usize {
        let graph = self.graph.read();
        graph
            .nodes
            .as_slice()
            .iter()
            .filter(|node| matches!(node, Node::Step { .. }))
            .count()
    }

    /// Returns the first declared step.
    pub fn get_first_step(&self) -> Option<Step> {
        let graph = self.graph.read();
        graph.nodes.as_slice().iter().find_map(|node| match node {
            Node::Step { step, .. } => Some(step.clone()),
            _ => None,
        })
    }

    /// Returns the step named `name` and the scope it was declared in.
    pub fn get_step_by_name(&self, name: &str) -> Option<(Step, Workflow)> {
        let graph = self.graph.read();
        graph.nodes.as_slice().iter().find_map(|node| match node {
            Node::Step { step, context, .. } if step.name() == name => {
                Some((step.clone(), self.scope(*context)))
            }
            _ => None,
        })
    }

    /// Returns the step declared right after `name`, or `None` if it is the last one.
    ///
    /// Fails if no step is named `name`.
    pub fn get_next_step(&self, name: &str) -> Result<Option<Step>, WorkflowError> {
        let steps = self.steps();
        let index = steps
            .iter()
            .position(|(step, _)| step.name() == name)
            .ok_or_else(|| WorkflowError::StepNotFound(StepName::new(name)))?;
        Ok(steps.get(index + 1).map(|(step, _)| step.clone()))
    }

    /// Returns every hook of kind `K` with its declaring scope, in declaration order.
    pub fn hooks<K: HookPoint>(&self) -> Vec<(crate::hook::HookFn<K::Event>, Workflow)> {
        let graph = self.graph.read();
        graph
            .nodes
            .as_slice()
            .iter()
            .filter_map(|node| match node {
                Node::Hook { hook, context, .. } => {
                    K::select(hook).map(|f| (f, self.scope(*context)))
                }
                _ => None,
            })
            .collect()
    }

    /// Returns every declared hook with its declaring scope, in declaration order.
    pub fn all_hooks(&self) -> Vec<(Hook, Workflow)> {
        let graph = self.graph.read();
        graph
            .nodes
            .as_slice()
            .iter()
            .filter_map(|node| match node {
                Node::Hook { hook, context, .. } => Some((hook.clone(), self.scope(*context))),
                _ => None,
            })
            .collect()
    }

    /// Returns `true` if both handles point at the same scope of the same graph.
    pub fn same_scope(&self, other: &Workflow) -> bool {
        Arc::ptr_eq(&self.graph, &other.graph) && self.context == other.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{OnStepCompleted, OnWorkflowCompleted};
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn passthrough(name: &str) -> Step {
        Step::new(name, |ctx| async move { Ok(ctx.state) })
    }

    fn names(workflow: &Workflow) -> Vec<String> {
        workflow
            .step_names()
            .into_iter()
            .map(|name| name.as_str().to_string())
            .collect()
    }

    #[test]
    fn test_steps_keep_declaration_order() {
        let workflow = Workflow::new("w")
            .step(passthrough("a"))
            .step(passthrough("b"))
            .step(passthrough("c"));
        let workflow = workflow.ready().expect("valid workflow");

        assert_eq!(names(&workflow), vec!["a", "b", "c"]);
        assert_eq!(
            workflow
                .get_next_step("a")
                .expect("known step")
                .map(|s| s.name().clone()),
            Some(StepName::new("b"))
        );
        assert!(workflow.get_next_step("c").expect("known step").is_none());
        assert!(matches!(
            workflow.get_next_step("zzz"),
            Err(WorkflowError::StepNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_decorator_on_same_scope() {
        let workflow = Workflow::new("w");
        workflow.decorate("db", 1u8).expect("first declaration");
        let err = workflow.decorate("db", 2u8).unwrap_err();
        assert_eq!(err, WorkflowError::DuplicateDecorator("db".into()));
    }

    #[test]
    fn test_child_scope_resolves_ancestor_decorators() {
        let workflow = Workflow::new("w");
        workflow.decorate("db", "postgres".to_string()).expect("declared");

        let plugin = Plugin::new("p", |scope: &Workflow, _: ()| {
            // Shadowing an ancestor key is allowed.
            scope.decorate("db", "sqlite".to_string())?;
            scope.decorate("cache", 5u32)?;
            Ok(())
        });
        let child = workflow.register(plugin, ());
        workflow.ready().expect("valid workflow");

        assert_eq!(
            child.decorator::<String>("db").as_deref().map(String::as_str),
            Some("sqlite")
        );
        assert_eq!(child.decorator::<u32>("cache").as_deref(), Some(&5));
        assert_eq!(
            workflow.decorator::<String>("db").as_deref().map(String::as_str),
            Some("postgres")
        );
        assert!(!workflow.has_decorator("cache"));
    }

    #[test]
    fn test_plugin_steps_land_inside_plugin_region() {
        let plugin = Plugin::new("p", |scope: &Workflow, _: ()| {
            scope.step(passthrough("p-inner"));
            Ok(())
        });

        let workflow = Workflow::new("w").step(passthrough("first"));
        workflow
            .register(plugin, ())
            .step(passthrough("p-chained"));
        workflow.step(passthrough("last"));

        let workflow = workflow.ready().expect("valid workflow");
        assert_eq!(names(&workflow), vec!["first", "p-chained", "p-inner", "last"]);
    }

    #[test]
    fn test_later_sibling_regions_survive_earlier_expansion() {
        let a = Plugin::new("a", |scope: &Workflow, _: ()| {
            scope.step(passthrough("a-1")).step(passthrough("a-2"));
            Ok(())
        });
        let b = Plugin::new("b", |scope: &Workflow, _: ()| {
            scope.step(passthrough("b-1"));
            Ok(())
        });

        let workflow = Workflow::new("w");
        workflow.register(a, ()).step(passthrough("a-0"));
        workflow.register(b, ()).step(passthrough("b-0"));
        let workflow = workflow.ready().expect("valid workflow");

        assert_eq!(names(&workflow), vec!["a-0", "a-1", "a-2", "b-0", "b-1"]);
    }

    #[test]
    fn test_nested_plugins_expand_in_place() {
        let inner = Plugin::new("inner", |scope: &Workflow, _: ()| {
            scope.step(passthrough("inner-1"));
            Ok(())
        });
        let outer = Plugin::new("outer", move |scope: &Workflow, _: ()| {
            scope.step(passthrough("outer-1"));
            scope.register(inner.clone(), ());
            scope.step(passthrough("outer-2"));
            Ok(())
        });

        let workflow = Workflow::new("w");
        workflow.register(outer, ());
        workflow.step(passthrough("root-last"));
        let workflow = workflow.ready().expect("valid workflow");

        assert_eq!(
            names(&workflow),
            vec!["outer-1", "inner-1", "outer-2", "root-last"]
        );
    }

    #[test]
    fn test_dependency_registered_in_wrong_order() {
        let a = Plugin::new("a", |_: &Workflow, _: ()| Ok(()));
        let b = Plugin::new("b", |_: &Workflow, _: ()| Ok(())).depends_on("a");

        let workflow = Workflow::new("w");
        workflow.register(b, ());
        workflow.register(a, ());

        let err = workflow.ready().unwrap_err();
        assert_eq!(
            err,
            WorkflowError::UnsatisfiedDependencies {
                plugin: "b".to_string(),
                missing: vec!["a".to_string()],
            }
        );
    }

    #[test]
    fn test_dependency_satisfied_by_ancestor_scope() {
        let a = Plugin::new("a", |_: &Workflow, _: ()| Ok(()));
        let c = Plugin::new("c", |_: &Workflow, _: ()| Ok(())).depends_on("a");
        let b = Plugin::new("b", move |scope: &Workflow, _: ()| {
            scope.register(c.clone(), ());
            Ok(())
        })
        .depends_on("a");

        let workflow = Workflow::new("w");
        workflow.register(a, ());
        workflow.register(b, ());
        assert!(workflow.ready().is_ok());
    }

    #[test]
    fn test_shared_decorators_reach_later_siblings() {
        let db = Plugin::new("db", |scope: &Workflow, url: String| {
            scope.decorate("db-url", url)?;
            Ok(())
        })
        .share_decorators();
        let repo = Plugin::new("repo", |scope: &Workflow, table: String| {
            scope.decorate("table", table)?;
            Ok(())
        })
        .depends_on("db");

        let workflow = Workflow::new("w");
        workflow.register(db, "postgres://localhost".to_string());
        let repo_scope = workflow.register(
            repo,
            PluginOptions::factory(|scope: &Workflow| {
                let url = scope.decorator::<String>("db-url");
                format!("users@{}", url.as_deref().map_or("none", String::as_str))
            }),
        );
        workflow.ready().expect("valid workflow");

        assert!(workflow.has_decorator("db-url"));
        assert_eq!(
            repo_scope
                .decorator::<String>("table")
                .as_deref()
                .map(String::as_str),
            Some("users@postgres://localhost")
        );
    }

    #[test]
    fn test_ready_is_idempotent() {
        let plugin = Plugin::new("p", |scope: &Workflow, _: ()| {
            scope
                .step(passthrough("p-step"))
                .on_step_completed(|_, _| async { Ok(()) });
            Ok(())
        });
        let workflow = Workflow::new("w").step(passthrough("a"));
        workflow.register(plugin, ());

        let first = assert_ok!(workflow.ready());
        let steps_once = names(&first);
        let hooks_once = first.hooks::<OnStepCompleted>().len();

        let second = workflow.ready().expect("valid workflow");
        assert_eq!(names(&second), steps_once);
        assert_eq!(second.hooks::<OnStepCompleted>().len(), hooks_once);
        assert_eq!(hooks_once, 1);
    }

    #[test]
    fn test_hooks_remember_declaring_scope() {
        let plugin = Plugin::new("p", |scope: &Workflow, _: ()| {
            scope.decorate("tag", "plugin".to_string())?;
            scope.on_workflow_completed(|_, _| async { Ok(()) });
            Ok(())
        });
        let workflow = Workflow::new("w").step(passthrough("a"));
        workflow.on_workflow_completed(|_, _| async { Ok(()) });
        workflow.register(plugin, ());
        let workflow = workflow.ready().expect("valid workflow");

        let hooks = workflow.hooks::<OnWorkflowCompleted>();
        assert_eq!(hooks.len(), 2);
        assert!(hooks[0].1.is_root());
        assert!(!hooks[1].1.is_root());
        assert_eq!(
            hooks[1].1.decorator::<String>("tag").as_deref().map(String::as_str),
            Some("plugin")
        );
        assert!(hooks[0].1.decorator::<String>("tag").is_none());
    }

    #[test]
    fn test_step_scope_is_returned_with_step() {
        let plugin = Plugin::new("p", |scope: &Workflow, _: ()| {
            scope.step(passthrough("inner"));
            Ok(())
        });
        let workflow = Workflow::new("w").step(passthrough("outer"));
        let child = workflow.register(plugin, ());
        let workflow = workflow.ready().expect("valid workflow");

        let (_, scope) = workflow.get_step_by_name("inner").expect("declared");
        assert!(scope.same_scope(&child));
        let (_, scope) = workflow.get_step_by_name("outer").expect("declared");
        assert!(scope.is_root());
        assert!(workflow.get_step_by_name("missing").is_none());
    }

    #[test]
    fn test_declaring_after_ready_is_reported() {
        let workflow = Workflow::new("w").step(passthrough("a"));
        workflow.ready().expect("valid workflow");

        workflow.step(passthrough("b"));
        assert!(!workflow.has_step("b"));
        assert_err!(workflow.ready());
        assert!(matches!(
            workflow.ready(),
            Err(WorkflowError::DeclaredAfterReady(_))
        ));
        assert!(matches!(
            workflow.decorate("late", 1u8),
            Err(WorkflowError::DeclaredAfterReady(_))
        ));
    }

    #[test]
    fn test_duplicate_step_names_are_rejected() {
        let workflow = Workflow::new("w")
            .step(passthrough("a"))
            .step(passthrough("a"));
        assert_eq!(
            workflow.ready().unwrap_err(),
            WorkflowError::DuplicateStep(StepName::new("a"))
        );
    }

    #[test]
    fn test_plugin_body_error_is_wrapped() {
        let plugin = Plugin::new("broken", |_: &Workflow, _: ()| {
            anyhow::bail!("missing credentials")
        });
        let workflow = Workflow::new("w").step(passthrough("a"));
        workflow.register(plugin, ());
        assert_eq!(
            workflow.ready().unwrap_err(),
            WorkflowError::Plugin {
                plugin: "broken".to_string(),
                details: "missing credentials".to_string(),
            }
        );
    }

    #[test]
    fn test_zero_attempts_is_a_configuration_error() {
        let workflow = Workflow::new("w").step(passthrough("a").max_attempts(0));
        assert!(matches!(
            workflow.ready(),
            Err(WorkflowError::Configuration(_))
        ));
    }

    #[test]
    fn test_concurrent_ready_expands_plugins_once() {
        let expansions = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = Arc::clone(&expansions);
        let plugin = Plugin::new("slow", move |scope: &Workflow, _: ()| {
            counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(50));
            scope.on_step_completed(|_, _| async { Ok(()) });
            Ok(())
        });
        let workflow = Workflow::new("w").step(passthrough("a"));
        workflow.register(plugin, ());

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let workflow = workflow.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    workflow.ready().is_ok()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().expect("thread finishes"));
        }

        assert_eq!(expansions.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(workflow.hooks::<OnStepCompleted>().len(), 1);
        assert_ok!(workflow.ready());
    }

    #[tokio::test]
    async fn test_handler_sees_declaring_scope() {
        let plugin = Plugin::new("p", |scope: &Workflow, _: ()| {
            scope.decorate("greeting", "hello".to_string())?;
            scope.step(Step::new("greet", |ctx| async move {
                let greeting = ctx
                    .workflow
                    .decorator::<String>("greeting")
                    .map(|g| g.to_string())
                    .unwrap_or_default();
                Ok(json!(format!("{} {}", greeting, ctx.state.as_str().unwrap_or(""))))
            }));
            Ok(())
        });
        let workflow = Workflow::new("w");
        workflow.register(plugin, ());
        let workflow = workflow.ready().expect("valid workflow");

        let (step, scope) = workflow.get_step_by_name("greet").expect("declared");
        let outcome = step
            .handler()
            .run(crate::step::StepContext {
                step: step.name().clone(),
                state: json!("world"),
                workflow: scope,
                attempt: 1,
            })
            .await
            .expect("handler succeeds");
        assert_eq!(outcome.into_step_result(), crate::step::StepResult::Success {
            state: json!("hello world")
        });
    }
}
