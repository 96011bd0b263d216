//! Request routing: per-method static tables plus a radix tree for
//! parameterised templates.
//!
//! A template like `/user/{id}` is parsed at registration; parameter names
//! must match `[a-z0-9_]+` and an invalid template terminates the process —
//! registration happens at startup, so this surfaces the mistake early. At
//! match time a literal child always wins over the parameter child; only a
//! segment with neither fails the match.
//!
//! Eight independent tables, one per method. `OPTIONS` carries a built-in
//! `*` route answering the allowed-methods list.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use crate::config;
use crate::http::request::{Method, Request, Target, METHOD_COUNT};
use crate::http::response::{Response, StatusCode};
use crate::http::pct_decode;

pub type Params = HashMap<String, String>;
pub type Handler = Box<dyn Fn(&Request) -> Response + Send + Sync>;
pub type DynHandler = Box<dyn Fn(&Request, &Params) -> Response + Send + Sync>;

struct ParamChild {
    name: String,
    child: Box<Node>,
}

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    param_child: Option<ParamChild>,
    handler: Option<DynHandler>,
}

#[derive(Default)]
struct RadixTree {
    root: Node,
}

enum Part<'a> {
    Literal(&'a str),
    Param(&'a str),
}

fn template_parts(template: &str) -> impl Iterator<Item = Part<'_>> {
    template.split('/').map(|segment| {
        if let Some(name) = segment
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
        {
            let valid = !name.is_empty()
                && name
                    .bytes()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'_');
            if !valid {
                log::error!("invalid parameter name in route template `{}`", template);
                std::process::abort();
            }
            Part::Param(name)
        } else {
            Part::Literal(segment)
        }
    })
}

impl RadixTree {
    fn insert(&mut self, template: &str, handler: DynHandler) {
        let mut current = &mut self.root;
        for part in template_parts(template) {
            current = match part {
                Part::Literal(segment) => current.children.entry(segment.to_string()).or_default(),
                Part::Param(name) => {
                    &mut *current
                        .param_child
                        .get_or_insert_with(|| ParamChild {
                            name: name.to_string(),
                            child: Box::default(),
                        })
                        .child
                }
            };
        }
        current.handler = Some(handler);
    }

    fn walk(&self, path: &str) -> Option<(&Node, Params)> {
        let mut current = &self.root;
        let mut params = Params::new();
        for segment in path.split('/') {
            if let Some(child) = current.children.get(segment) {
                current = child;
            } else if let Some(param) = &current.param_child {
                params.insert(param.name.clone(), segment.to_string());
                current = &*param.child;
            } else {
                return None;
            }
        }
        Some((current, params))
    }

    fn route(&self, path: &str, request: &Request) -> Option<Response> {
        let (node, params) = self.walk(path)?;
        node.handler.as_ref().map(|h| h(request, &params))
    }

    fn matches(&self, path: &str) -> bool {
        self.walk(path).map_or(false, |(node, _)| node.handler.is_some())
    }

    fn clear(&mut self) {
        self.root = Node::default();
    }
}

#[derive(Default)]
struct MethodTable {
    statics: HashMap<String, Handler>,
    tree: RadixTree,
}

struct Tables([RwLock<MethodTable>; METHOD_COUNT]);

static TABLES: OnceLock<Tables> = OnceLock::new();

fn tables() -> &'static Tables {
    TABLES.get_or_init(|| {
        let tables = Tables(std::array::from_fn(|_| RwLock::new(MethodTable::default())));
        // Built-in `OPTIONS *` route.
        tables.0[Method::Options.index()]
            .write()
            .unwrap()
            .statics
            .insert(
                "*".to_string(),
                Box::new(|_req| {
                    let mut response = Response::new(StatusCode::Ok);
                    response.set_header("Content-Length", "0");
                    response.set_header("Allow", "GET, HEAD, POST, PUT, DELETE, OPTIONS");
                    response
                }),
            );
        tables
    })
}

fn table(method: Method) -> &'static RwLock<MethodTable> {
    &tables().0[method.index()]
}

// ── Registration ──

pub fn register(method: Method, path: &str, handler: impl Fn(&Request) -> Response + Send + Sync + 'static) {
    table(method)
        .write()
        .unwrap()
        .statics
        .insert(path.to_string(), Box::new(handler));
}

pub fn get(path: &str, handler: impl Fn(&Request) -> Response + Send + Sync + 'static) {
    register(Method::Get, path, handler);
}

pub fn head(path: &str, handler: impl Fn(&Request) -> Response + Send + Sync + 'static) {
    register(Method::Head, path, handler);
}

pub fn post(path: &str, handler: impl Fn(&Request) -> Response + Send + Sync + 'static) {
    register(Method::Post, path, handler);
}

pub fn put(path: &str, handler: impl Fn(&Request) -> Response + Send + Sync + 'static) {
    register(Method::Put, path, handler);
}

pub fn delete(path: &str, handler: impl Fn(&Request) -> Response + Send + Sync + 'static) {
    register(Method::Delete, path, handler);
}

/// Parameterised templates, e.g. `/user/{id}`.
pub mod dynamic {
    use super::*;

    pub fn register(
        method: Method,
        template: &str,
        handler: impl Fn(&Request, &Params) -> Response + Send + Sync + 'static,
    ) {
        table(method)
            .write()
            .unwrap()
            .tree
            .insert(template, Box::new(handler));
    }

    pub fn get(template: &str, handler: impl Fn(&Request, &Params) -> Response + Send + Sync + 'static) {
        register(Method::Get, template, handler);
    }

    pub fn head(template: &str, handler: impl Fn(&Request, &Params) -> Response + Send + Sync + 'static) {
        register(Method::Head, template, handler);
    }

    pub fn post(template: &str, handler: impl Fn(&Request, &Params) -> Response + Send + Sync + 'static) {
        register(Method::Post, template, handler);
    }

    pub fn put(template: &str, handler: impl Fn(&Request, &Params) -> Response + Send + Sync + 'static) {
        register(Method::Put, template, handler);
    }

    pub fn delete(template: &str, handler: impl Fn(&Request, &Params) -> Response + Send + Sync + 'static) {
        register(Method::Delete, template, handler);
    }

    /// Drop every template for `method`. Test hook.
    pub fn clear(method: Method) {
        table(method).write().unwrap().tree.clear();
    }
}

// ── Matching ──

/// Resolve a request to a response: static table first, then the radix
/// tree; 400 for undecodable or unsupported targets, 405 when another
/// method's table knows the path, 404 otherwise.
pub fn route(request: &Request) -> Response {
    match &request.line.target {
        Target::Origin { path, .. } => {
            let decoded = match pct_decode(path) {
                Ok(decoded) => decoded,
                Err(e) => {
                    log::error!("failed to decode URI `{}`: {}", path, e);
                    return error_response(StatusCode::BadRequest);
                }
            };
            {
                let table = table(request.line.method).read().unwrap();
                if let Some(handler) = table.statics.get(&decoded) {
                    return handler(request);
                }
                if let Some(response) = table.tree.route(&decoded, request) {
                    return response;
                }
            }
            if other_method_matches(request.line.method, &decoded) {
                return error_response(StatusCode::MethodNotAllowed);
            }
            error_response(StatusCode::NotFound)
        }
        Target::Asterisk => {
            let table = table(request.line.method).read().unwrap();
            match table.statics.get("*") {
                Some(handler) => handler(request),
                None => error_response(StatusCode::NotFound),
            }
        }
        Target::Absolute | Target::Authority => error_response(StatusCode::BadRequest),
    }
}

fn other_method_matches(method: Method, path: &str) -> bool {
    (0..METHOD_COUNT)
        .filter(|&i| i != method.index())
        .any(|i| {
            let table = tables().0[i].read().unwrap();
            table.statics.contains_key(path) || table.tree.matches(path)
        })
}

/// Error response through the configured error-page provider.
pub fn error_response(status: StatusCode) -> Response {
    let body = config::error_page(status);
    Response::with_body(status, "text/html; charset=utf-8", body)
}
