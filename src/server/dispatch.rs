//! Dispatch table: rpc name → handler bound to its service instance.
//!
//! Built with `register` before serving and read-only afterwards, so
//! connection tasks share it behind an `Arc` without locking.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::message::Message;
use crate::stream::Stream;
use crate::types::{Error, Result};

/// Future returned by a handler. `Some(output)` is sent back before the
/// stream is closed.
pub type HandlerFuture = BoxFuture<'static, Result<Option<Box<dyn Message>>>>;

/// A handler for one rpc of service `S`.
pub type Handler<S> = Arc<dyn Fn(Arc<S>, Stream) -> HandlerFuture + Send + Sync>;

/// Identity of a method implementation, used to reject registering the same
/// method twice under different names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodToken(pub &'static str);

/// One method of a service description.
pub struct Method<S> {
    pub rpc: String,
    pub handler: Handler<S>,
    pub token: MethodToken,
}

impl<S> Method<S> {
    pub fn new(rpc: impl Into<String>, token: MethodToken, handler: Handler<S>) -> Self {
        Self {
            rpc: rpc.into(),
            handler,
            token,
        }
    }
}

impl<S> Clone for Method<S> {
    fn clone(&self) -> Self {
        Self {
            rpc: self.rpc.clone(),
            handler: self.handler.clone(),
            token: self.token,
        }
    }
}

impl<S> fmt::Debug for Method<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("rpc", &self.rpc)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Describes the rpcs a service of type `S` exposes.
pub trait Description<S>: Send + Sync {
    fn num_methods(&self) -> usize;

    /// Method at index `n`, for `n < num_methods()`.
    fn method(&self, n: usize) -> Option<Method<S>>;
}

type BoundHandler = Arc<dyn Fn(Stream) -> HandlerFuture + Send + Sync>;

/// A registered rpc: handler plus the service instance it runs against.
#[derive(Clone)]
pub(crate) struct Entry {
    token: MethodToken,
    service: &'static str,
    handler: BoundHandler,
}

impl Entry {
    pub(crate) fn call(&self, stream: Stream) -> HandlerFuture {
        (self.handler)(stream)
    }

    pub(crate) fn service(&self) -> &'static str {
        self.service
    }
}

#[derive(Clone, Default)]
pub struct DispatchTable {
    entries: HashMap<String, Entry>,
    tokens: HashSet<MethodToken>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every method of `desc` against `srv`.
    ///
    /// All or nothing: a duplicate rpc name or method token, either within
    /// `desc` or against earlier registrations, inserts nothing.
    pub fn register<S>(&mut self, srv: Arc<S>, desc: &dyn Description<S>) -> Result<()>
    where
        S: Send + Sync + 'static,
    {
        let mut methods = Vec::with_capacity(desc.num_methods());
        let mut names = HashSet::new();
        let mut tokens = HashSet::new();
        for n in 0..desc.num_methods() {
            let method = desc
                .method(n)
                .ok_or_else(|| Error::internal(format!("description has no method {}", n)))?;
            if self.entries.contains_key(&method.rpc) || !names.insert(method.rpc.clone()) {
                return Err(Error::internal(format!("duplicate rpc: {}", method.rpc)));
            }
            if self.tokens.contains(&method.token) || !tokens.insert(method.token) {
                return Err(Error::internal(format!(
                    "method {} registered twice (as {})",
                    method.token.0, method.rpc
                )));
            }
            methods.push(method);
        }

        let service = std::any::type_name::<S>();
        for method in methods {
            let srv = srv.clone();
            let handler = method.handler;
            tracing::debug!(rpc = %method.rpc, service, "registered rpc");
            self.tokens.insert(method.token);
            self.entries.insert(
                method.rpc,
                Entry {
                    token: method.token,
                    service,
                    handler: Arc::new(move |stream: Stream| handler(srv.clone(), stream)),
                },
            );
        }
        Ok(())
    }

    pub(crate) fn lookup(&self, rpc: &str) -> Option<&Entry> {
        self.entries.get(rpc)
    }

    pub fn contains(&self, rpc: &str) -> bool {
        self.entries.contains_key(rpc)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered rpc names, sorted.
    pub fn rpcs(&self) -> Vec<&str> {
        let mut rpcs: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        rpcs.sort_unstable();
        rpcs
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for rpc in self.rpcs() {
            if let Some(entry) = self.entries.get(rpc) {
                map.entry(&rpc, &entry.token.0);
            }
        }
        map.finish()
    }
}

// =============================================================================
// Handler builders
// =============================================================================

/// Build a handler for a unary rpc: decode one request, run `f`, send the
/// response.
pub fn unary<S, I, O, F, Fut>(f: F) -> Handler<S>
where
    S: Send + Sync + 'static,
    I: Message + Default + 'static,
    O: Message + 'static,
    F: Fn(Arc<S>, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |srv: Arc<S>, stream: Stream| {
        let f = f.clone();
        Box::pin(async move {
            let mut input = I::default();
            match stream.msg_recv(&mut input).await {
                Ok(()) => {}
                Err(Error::EndOfStream) => {
                    return Err(Error::protocol(format!(
                        "{}: request message missing",
                        stream.rpc()
                    )))
                }
                Err(err) => return Err(err),
            }
            let output = f(srv, input).await?;
            Ok(Some(Box::new(output) as Box<dyn Message>))
        }) as HandlerFuture
    })
}

/// Build a handler for a streaming rpc. `f` drives the stream itself; the
/// stream is closed when it returns.
pub fn streaming<S, F, Fut>(f: F) -> Handler<S>
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, Stream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |srv: Arc<S>, stream: Stream| {
        let call = f(srv, stream);
        Box::pin(async move {
            call.await?;
            Ok(None)
        }) as HandlerFuture
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorClass;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Text {
        data: String,
    }

    struct Greeter;

    struct GreeterDesc {
        methods: Vec<Method<Greeter>>,
    }

    impl Description<Greeter> for GreeterDesc {
        fn num_methods(&self) -> usize {
            self.methods.len()
        }

        fn method(&self, n: usize) -> Option<Method<Greeter>> {
            self.methods.get(n).cloned()
        }
    }

    async fn hello(_: Arc<Greeter>, input: Text) -> Result<Text> {
        Ok(input)
    }

    fn method(rpc: &str, token: &'static str) -> Method<Greeter> {
        Method::new(rpc, MethodToken(token), unary(hello))
    }

    #[test]
    fn registers_every_method() {
        let mut table = DispatchTable::new();
        let desc = GreeterDesc {
            methods: vec![method("Hello", "greeter::hello"), method("Hi", "greeter::hi")],
        };
        table.register(Arc::new(Greeter), &desc).unwrap();

        assert_eq!(table.rpcs(), vec!["Hello", "Hi"]);
        assert!(table.contains("Hello"));
        assert!(table.lookup("Hello").unwrap().service().ends_with("Greeter"));
        assert!(table.lookup("Bye").is_none());
    }

    #[test]
    fn duplicate_name_rejects_whole_description() {
        let mut table = DispatchTable::new();
        let desc = GreeterDesc {
            methods: vec![method("Hello", "greeter::a"), method("Hello", "greeter::b")],
        };
        let err = table.register(Arc::new(Greeter), &desc).unwrap_err();
        assert!(err.is(ErrorClass::Internal));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_token_across_registrations() {
        let mut table = DispatchTable::new();
        let first = GreeterDesc {
            methods: vec![method("Hello", "greeter::hello")],
        };
        table.register(Arc::new(Greeter), &first).unwrap();

        let second = GreeterDesc {
            methods: vec![method("Other", "greeter::new"), method("Alias", "greeter::hello")],
        };
        let err = table.register(Arc::new(Greeter), &second).unwrap_err();
        assert!(err.to_string().contains("registered twice"));
        assert_eq!(table.rpcs(), vec!["Hello"]);
    }
}
