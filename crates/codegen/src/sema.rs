//! Semantic analysis: the discovery pass.
//!
//! One walk over the AST registers every globally visible name, every pool
//! variable, and every function signature, so the emission passes never
//! fail on declaration order. No machine code is emitted here. Problems
//! are collected into the context's diagnostics list; the orchestrator
//! refuses to start emission while it is non-empty.

use crate::builtins::is_builtin;
use crate::context::{Context, Direction, DynamicPool, FuncInfo, LinkField, LinkFieldTy, LinkagePool};
use crate::result::Diagnostic;
use crate::sym::{ScopeKind, SymbolKind};
use ailang_ast::{Node, PoolItem, Program, Span};
use log::{debug, info};

/// A function call seen during the walk, checked for arity once every
/// definition is known.
struct SeenCall {
    name: String,
    argc: usize,
    span: Span,
}

pub(crate) struct Analyzer {
    calls: Vec<SeenCall>,
}

/// Run the discovery pass over `program`.
pub(crate) fn analyze(ctx: &mut Context, program: &Program) {
    let mut a = Analyzer { calls: Vec::new() };
    a.visit_program(ctx, program);
    a.check_arity(ctx);
    info!(
        "semantic analysis complete: {} symbols, {} functions, {} pool variables",
        ctx.symbols.len(),
        ctx.functions.len(),
        ctx.symbols.pool_count(),
    );
}

impl Analyzer {
    fn visit_program(&mut self, ctx: &mut Context, program: &Program) {
        for decl in &program.declarations {
            self.visit(ctx, decl);
        }
    }

    pub(crate) fn visit_all(&mut self, ctx: &mut Context, nodes: &[Node]) {
        for node in nodes {
            self.visit(ctx, node);
        }
    }

    fn visit(&mut self, ctx: &mut Context, node: &Node) {
        match node {
            Node::Function {
                name,
                parameters,
                body,
            } => self.visit_function(ctx, name, parameters, body),
            Node::SubRoutine { name, body } => {
                let label = ctx.asm.create_label();
                if ctx.subroutines.insert(name.clone(), label).is_some() {
                    ctx.diagnostics
                        .push(Diagnostic::new(format!("duplicate subroutine {name}"), Span::NONE));
                }
                ctx.symbols.register_global(name, SymbolKind::Function);
                ctx.symbols.enter_scope(name, ScopeKind::Subroutine);
                self.visit_all(ctx, body);
                ctx.symbols.exit_scope();
            }
            Node::LoopActor { name, body } => {
                let label = ctx.asm.create_label();
                let key = format!("Actor.{name}");
                if ctx.subroutines.insert(key.clone(), label).is_some() {
                    ctx.diagnostics
                        .push(Diagnostic::new(format!("duplicate actor {name}"), Span::NONE));
                } else {
                    ctx.actor_order.push(name.clone());
                }
                ctx.symbols.register_global(&key, SymbolKind::Function);
                // Actors run in the main frame, like subroutines.
                ctx.symbols.enter_scope(&key, ScopeKind::Subroutine);
                self.visit_all(ctx, body);
                ctx.symbols.exit_scope();
            }
            Node::Pool {
                pool_type,
                name,
                body,
            } => self.visit_pool(ctx, pool_type, name, body),
            Node::LinkagePoolDecl { name, body } => self.visit_linkage_pool(ctx, name, body),
            Node::Assignment { target, value, .. } => {
                self.visit(ctx, value);
                self.register_assignment_target(ctx, target);
            }
            Node::FunctionCall {
                function,
                arguments,
                span,
            } => {
                self.calls.push(SeenCall {
                    name: function.clone(),
                    argc: arguments.len(),
                    span: *span,
                });
                self.visit_all(ctx, arguments);
            }
            Node::If {
                condition,
                then_body,
                else_body,
            } => {
                self.visit(ctx, condition);
                self.visit_all(ctx, then_body);
                self.visit_all(ctx, else_body);
            }
            Node::While { condition, body } => {
                self.visit(ctx, condition);
                self.visit_all(ctx, body);
            }
            Node::Branch {
                expression,
                cases,
                default,
            } => {
                self.visit(ctx, expression);
                for case in cases {
                    self.visit(ctx, &case.value);
                    self.visit_all(ctx, &case.body);
                }
                self.visit_all(ctx, default);
            }
            Node::Try {
                body,
                catch_clauses,
                finally_body,
            } => {
                self.visit_all(ctx, body);
                for clause in catch_clauses {
                    self.visit_all(ctx, &clause.body);
                }
                self.visit_all(ctx, finally_body);
            }
            Node::ReturnValue { value } => {
                if let Some(value) = value {
                    self.visit(ctx, value);
                }
            }
            Node::SendMessage { target, value } => {
                self.visit(ctx, target);
                self.visit(ctx, value);
            }
            Node::DebugAssert { condition, .. } => self.visit(ctx, condition),
            Node::Number { .. }
            | Node::String { .. }
            | Node::Boolean { .. }
            | Node::Identifier { .. }
            | Node::BreakLoop { .. }
            | Node::ContinueLoop { .. }
            | Node::ReceiveMessage { .. }
            | Node::RunTask { .. }
            | Node::Library { .. } => {}
        }
    }

    pub(crate) fn visit_function(
        &mut self,
        ctx: &mut Context,
        name: &str,
        parameters: &[ailang_ast::Parameter],
        body: &[Node],
    ) {
        let full_name = match &ctx.library_prefix {
            Some(prefix) if !name.contains('.') => format!("{prefix}.{name}"),
            _ => name.to_string(),
        };
        if ctx.functions.contains_key(&full_name) {
            ctx.diagnostics.push(Diagnostic::new(
                format!("duplicate function {full_name}"),
                Span::NONE,
            ));
            return;
        }
        let label = ctx.asm.create_label();
        let return_label = ctx.asm.create_label();
        ctx.symbols.register_global(&full_name, SymbolKind::Function);
        let scope = ctx.symbols.enter_scope(&full_name, ScopeKind::Function);
        let mut params = Vec::with_capacity(parameters.len());
        let mut param_types = Vec::with_capacity(parameters.len());
        for p in parameters {
            ctx.symbols.register_parameter(&p.name);
            params.push(p.name.clone());
            param_types.push(p.ty.clone());
        }
        self.visit_all(ctx, body);
        ctx.symbols.exit_scope();
        debug!("registered function {full_name} ({} params)", params.len());
        ctx.functions.insert(
            full_name,
            FuncInfo {
                label,
                return_label,
                params,
                param_types,
                scope,
            },
        );
    }

    fn register_assignment_target(&mut self, ctx: &mut Context, target: &str) {
        if ctx.symbols.lookup(target).is_some() {
            return;
        }
        if target.contains('.') {
            // Dotted targets reach pool members or linkage fields; those
            // resolve against pool layouts at emission, not frame slots.
            return;
        }
        ctx.symbols.register_variable(target);
    }

    fn visit_pool(&mut self, ctx: &mut Context, pool_type: &str, name: &str, body: &[PoolItem]) {
        let pool_name = format!("{pool_type}.{name}");
        if pool_type == "DynamicPool" {
            if ctx.dynamic_pools.contains_key(&pool_name) {
                return;
            }
            let mut members = Vec::new();
            let mut offset = 16; // 8 bytes capacity, 8 bytes size
            for item in body {
                members.push((item.key.clone(), offset));
                offset += 8;
            }
            let slot = ctx.symbols.register_variable(&pool_name).offset;
            debug!("registered {pool_name} with {} members", members.len());
            ctx.dynamic_pools
                .insert(pool_name, DynamicPool { members, slot });
        } else {
            ctx.symbols.register_global(&pool_name, SymbolKind::Pool);
            for item in body {
                let var_name = format!("{pool_name}.{}", item.key);
                if ctx.symbols.lookup_in(crate::sym::ScopeId(0), &var_name).is_none() {
                    ctx.symbols.register_pool_variable(&var_name);
                }
            }
        }
    }

    fn visit_linkage_pool(&mut self, ctx: &mut Context, name: &str, body: &[PoolItem]) {
        let pool_name = format!("LinkagePool.{name}");
        if ctx.linkage_pools.contains_key(&pool_name) {
            return;
        }
        let mut pool = LinkagePool::default();
        let mut offset = 0;
        for item in body {
            let mut direction = Direction::InOut;
            let mut ty = LinkFieldTy::Integer;
            if matches!(item.value, Some(Node::String { .. })) {
                ty = LinkFieldTy::Str;
            }
            for (key, value) in &item.attributes {
                match key.as_str() {
                    "Initialize" => {
                        if matches!(value, Node::String { .. }) {
                            ty = LinkFieldTy::Str;
                        }
                    }
                    "Direction" => {
                        if let Node::String { value, .. } | Node::Identifier { name: value, .. } =
                            value
                        {
                            direction = match value.as_str() {
                                "Input" => Direction::Input,
                                "Output" => Direction::Output,
                                _ => Direction::InOut,
                            };
                        }
                    }
                    _ => {}
                }
            }
            pool.fields.push(LinkField {
                name: item.key.clone(),
                offset,
                direction,
                ty,
            });
            offset += 8;
        }
        pool.size = offset;
        debug!("registered {pool_name}, {} bytes", pool.size);
        ctx.linkage_pools.insert(pool_name, pool);
    }

    pub(crate) fn check_arity(&mut self, ctx: &mut Context) {
        for call in self.calls.drain(..) {
            if let Some(info) = ctx.functions.get(&call.name) {
                if info.params.len() != call.argc {
                    ctx.diagnostics.push(Diagnostic::new(
                        format!(
                            "{} takes {} argument(s), got {}",
                            call.name,
                            info.params.len(),
                            call.argc
                        ),
                        call.span,
                    ));
                }
            } else if !is_builtin(&call.name) && !call.name.contains('.') {
                ctx.diagnostics.push(Diagnostic::new(
                    format!("undefined function {}", call.name),
                    call.span,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Options;
    use ailang_ast::Node;

    fn ctx() -> Context<'static> {
        Context::new(Options::default(), None)
    }

    #[test]
    fn registers_forward_referenced_functions() {
        let mut ctx = ctx();
        let program = Program {
            declarations: vec![
                Node::assign("r", Node::call("Twice", vec![Node::number(21)])),
                Node::Function {
                    name: "Twice".to_string(),
                    parameters: vec![ailang_ast::Parameter {
                        name: "n".to_string(),
                        ty: None,
                        span: Span::NONE,
                    }],
                    body: vec![Node::ReturnValue {
                        value: Some(Box::new(Node::call(
                            "Multiply",
                            vec![Node::ident("n"), Node::number(2)],
                        ))),
                    }],
                },
            ],
        };
        analyze(&mut ctx, &program);
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.diagnostics);
        assert!(ctx.functions.contains_key("Twice"));
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let mut ctx = ctx();
        let program = Program {
            declarations: vec![
                Node::Function {
                    name: "F".to_string(),
                    parameters: vec![],
                    body: vec![],
                },
                Node::assign("r", Node::call("F", vec![Node::number(1)])),
            ],
        };
        analyze(&mut ctx, &program);
        assert_eq!(ctx.diagnostics.len(), 1);
        assert!(ctx.diagnostics[0].message.contains("takes 0 argument"));
    }

    #[test]
    fn undefined_function_is_reported() {
        let mut ctx = ctx();
        let program = Program {
            declarations: vec![Node::assign("r", Node::call("NoSuchThing", vec![]))],
        };
        analyze(&mut ctx, &program);
        assert_eq!(ctx.diagnostics.len(), 1);
    }

    #[test]
    fn fixed_pool_variables_get_stable_indices() {
        let mut ctx = ctx();
        let pool = Node::Pool {
            pool_type: "FixedPool".to_string(),
            name: "Cfg".to_string(),
            body: vec![
                ailang_ast::PoolItem {
                    key: "max".to_string(),
                    value: Some(Node::number(10)),
                    attributes: vec![],
                },
                ailang_ast::PoolItem {
                    key: "min".to_string(),
                    value: Some(Node::number(1)),
                    attributes: vec![],
                },
            ],
        };
        let program = Program {
            declarations: vec![pool],
        };
        analyze(&mut ctx, &program);
        let max = ctx.symbols.lookup("FixedPool.Cfg.max").unwrap();
        let min = ctx.symbols.lookup("FixedPool.Cfg.min").unwrap();
        assert_eq!(max.pool_index(), 0);
        assert_eq!(min.pool_index(), 1);
    }

    #[test]
    fn linkage_pool_fields_are_typed_and_spaced() {
        let mut ctx = ctx();
        let program = Program {
            declarations: vec![Node::LinkagePoolDecl {
                name: "Point".to_string(),
                body: vec![
                    ailang_ast::PoolItem {
                        key: "x".to_string(),
                        value: None,
                        attributes: vec![("Initialize".to_string(), Node::number(0))],
                    },
                    ailang_ast::PoolItem {
                        key: "tag".to_string(),
                        value: None,
                        attributes: vec![("Initialize".to_string(), Node::string(""))],
                    },
                ],
            }],
        };
        analyze(&mut ctx, &program);
        let pool = ctx.linkage_pools.get("LinkagePool.Point").unwrap();
        assert_eq!(pool.size, 16);
        assert_eq!(pool.field("x").unwrap().ty, LinkFieldTy::Integer);
        assert_eq!(pool.field("tag").unwrap().ty, LinkFieldTy::Str);
        assert_eq!(pool.field("tag").unwrap().offset, 8);
    }
}
