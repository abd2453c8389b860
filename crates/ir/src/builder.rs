//! Lowers the analyzed AST into a [`Dfg`].
//!
//! Statements append stack-slot operations to the current basic block;
//! structured control flow becomes jumps and conditional jumps. Nested calls
//! are flattened into operation sequences introducing `Temporary` slots, so no
//! call ever appears inside another operation. Semantic violations are
//! programmer errors and abort with an assertion; diagnostics are the
//! front-end's job.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::ast::{self, Expression, Statement, Symbols};
use crate::dfg::{
    BasicBlock, BlockExit, BlockId, CallSite, Dfg, FuncId, FunctionInfo, Operation, OperationKind,
    Stack, StackSlot,
};
use crate::dialect::Dialect;
use primitive_types::U256;

/// Build the data-flow graph for a program body.
///
/// `symbols` is consumed: the graph owns the variable arena afterwards so
/// ghost variables can extend it.
pub fn build_dfg<D: Dialect>(block: &ast::Block, symbols: Symbols, dialect: &D) -> Dfg {
    let mut graph = Dfg::new(symbols);

    let mut builder = DfgBuilder {
        current: graph.entry,
        graph: &mut graph,
        dialect,
        functions_by_name: FxHashMap::default(),
        for_loop: None,
        function_exit: None,
    };
    builder.register_functions(block);
    builder.visit_block(block);

    prune_unreachable(&mut graph);
    graph
}

struct ForLoopInfo {
    after: BlockId,
    post: BlockId,
}

struct DfgBuilder<'a, D: Dialect> {
    graph: &'a mut Dfg,
    dialect: &'a D,
    functions_by_name: FxHashMap<SmolStr, FuncId>,
    current: BlockId,
    for_loop: Option<ForLoopInfo>,
    function_exit: Option<BlockId>,
}

impl<'a, D: Dialect> DfgBuilder<'a, D> {
    /// Register every function definition up front so calls can be resolved
    /// regardless of definition order.
    fn register_functions(&mut self, block: &ast::Block) {
        for stmt in &block.statements {
            match stmt {
                Statement::FunctionDefinition(def) => {
                    let entry = self.graph.make_block();
                    let func = self.graph.functions.push(FunctionInfo {
                        name: def.name.clone(),
                        entry,
                        parameters: def.params.clone(),
                        return_variables: def.returns.clone(),
                        span: def.span,
                    });
                    let prev = self.functions_by_name.insert(def.name.clone(), func);
                    assert!(prev.is_none(), "duplicate function name `{}`", def.name);
                    self.register_functions(&def.body);
                }
                Statement::If(if_stmt) => self.register_functions(&if_stmt.body),
                Statement::Switch(switch) => {
                    for case in &switch.cases {
                        self.register_functions(&case.body);
                    }
                }
                Statement::For(for_loop) => {
                    self.register_functions(&for_loop.pre);
                    self.register_functions(&for_loop.body);
                    self.register_functions(&for_loop.post);
                }
                Statement::Block(inner) => self.register_functions(inner),
                _ => {}
            }
        }
    }

    fn visit_block(&mut self, block: &ast::Block) {
        for stmt in &block.statements {
            self.visit_stmt(stmt);
        }
    }

    fn visit_stmt(&mut self, stmt: &Statement) {
        match stmt {
            Statement::VariableDeclaration(decl) => self.visit_variable_declaration(decl),
            Statement::Assignment(assign) => {
                let vars: SmallVec<[_; 2]> = assign.targets.iter().copied().collect();
                self.visit_assignment_value(&assign.value, vars, assign.span);
            }
            Statement::Expression(stmt) => self.visit_expression_statement(stmt),
            Statement::If(if_stmt) => self.visit_if(if_stmt),
            Statement::Switch(switch) => self.visit_switch(switch),
            Statement::For(for_loop) => self.visit_for(for_loop),
            Statement::Break(_) => {
                let after = self
                    .for_loop
                    .as_ref()
                    .expect("`break` outside of a loop")
                    .after;
                self.jump(after, false);
                self.current = self.graph.make_block();
            }
            Statement::Continue(_) => {
                let post = self
                    .for_loop
                    .as_ref()
                    .expect("`continue` outside of a loop")
                    .post;
                self.jump(post, false);
                self.current = self.graph.make_block();
            }
            Statement::Leave(_) => {
                let exit = self.function_exit.expect("`leave` outside of a function");
                self.jump(exit, false);
                self.current = self.graph.make_block();
            }
            Statement::FunctionDefinition(def) => self.visit_function_definition(def),
            Statement::Block(inner) => self.visit_block(inner),
        }
    }

    fn visit_variable_declaration(&mut self, decl: &ast::VariableDeclaration) {
        let vars: SmallVec<[_; 2]> = decl.vars.iter().copied().collect();
        if let Some(value) = &decl.value {
            self.visit_assignment_value(value, vars, decl.span);
        } else {
            // Declaration without initializer: the variables start as zero.
            let input: Stack = decl
                .vars
                .iter()
                .map(|_| StackSlot::Literal(U256::zero()))
                .collect();
            self.push_assignment(input, vars, decl.span);
        }
    }

    fn visit_assignment_value(
        &mut self,
        value: &Expression,
        vars: SmallVec<[crate::ast::VarId; 2]>,
        span: crate::ast::Span,
    ) {
        match value {
            Expression::Call(call) => {
                let output = self.visit_call(call);
                assert_eq!(
                    vars.len(),
                    output.len(),
                    "assignment arity mismatch for `{}`",
                    call.callee
                );
                self.push_assignment(output, vars, span);
            }
            scalar => {
                assert_eq!(vars.len(), 1, "scalar assigned to multiple variables");
                let slot = self.visit_expr(scalar);
                self.push_assignment(vec![slot], vars, span);
            }
        }
    }

    fn push_assignment(
        &mut self,
        input: Stack,
        vars: SmallVec<[crate::ast::VarId; 2]>,
        span: crate::ast::Span,
    ) {
        let output: Stack = vars.iter().map(|v| StackSlot::Variable(*v)).collect();
        self.push_op(Operation {
            input,
            output,
            kind: OperationKind::Assignment { vars },
            span,
        });
    }

    fn visit_expression_statement(&mut self, stmt: &ast::ExpressionStatement) {
        let Expression::Call(call) = &stmt.expr else {
            panic!("expression statement must be a call");
        };
        let output = self.visit_call(call);
        assert!(output.is_empty(), "discarded call results");

        if let Some(builtin) = self.dialect.builtin(&call.callee) {
            if self.dialect.builtin_info(builtin).terminates {
                self.graph.block_mut(self.current).exit = BlockExit::Terminated;
                self.current = self.graph.make_block();
            }
        }
    }

    fn visit_if(&mut self, if_stmt: &ast::If) {
        let condition = self.visit_expr(&if_stmt.condition);
        let (body, after) = self.make_conditional_jump(condition);
        self.current = body;
        self.visit_block(&if_stmt.body);
        self.jump(after, false);
    }

    fn visit_switch(&mut self, switch: &ast::Switch) {
        assert!(!switch.cases.is_empty(), "switch without cases");

        // Bind the scrutinee to a ghost variable so every case compares
        // against the same slot.
        let scrutinee = self.visit_expr(&switch.expr);
        let ghost = self.graph.make_ghost_var();
        self.push_assignment(vec![scrutinee], SmallVec::from_slice(&[ghost]), switch.span);

        let after = self.graph.make_block();
        let (last, chained) = switch.cases.split_last().expect("switch without cases");

        for case in chained {
            let value = case.value.as_ref().expect("default case must come last");
            let compare = self.make_value_compare(ghost, value.value, switch.span);
            let (case_branch, else_branch) = self.make_conditional_jump(compare);
            self.current = case_branch;
            self.visit_block(&case.body);
            self.jump(after, false);
            self.current = else_branch;
        }

        if let Some(value) = &last.value {
            let compare = self.make_value_compare(ghost, value.value, switch.span);
            let case_branch = self.graph.make_block();
            self.make_conditional_jump_to(compare, case_branch, after);
            self.current = case_branch;
            self.visit_block(&last.body);
        } else {
            self.visit_block(&last.body);
        }
        self.jump(after, false);
    }

    /// `eq(<case value>, <ghost>)` as a ghost call; yields the comparison
    /// temporary.
    fn make_value_compare(
        &mut self,
        ghost: crate::ast::VarId,
        value: U256,
        span: crate::ast::Span,
    ) -> StackSlot {
        let builtin = self.dialect.equality_builtin();
        let info = self.dialect.builtin_info(builtin);
        debug_assert_eq!(info.args, 2);
        debug_assert_eq!(info.returns, 1);

        let call = self.graph.calls.push(CallSite {
            callee: info.name.clone(),
            returns: 1,
            literal_args: SmallVec::new(),
            span,
        });
        let output = StackSlot::Temporary(call, 0);
        self.push_op(Operation {
            input: vec![StackSlot::Variable(ghost), StackSlot::Literal(value)],
            output: vec![output],
            kind: OperationKind::BuiltinCall {
                builtin,
                call,
                args: 2,
            },
            span,
        });
        output
    }

    fn visit_for(&mut self, for_loop: &ast::ForLoop) {
        self.visit_block(&for_loop.pre);

        let constant_condition = match &for_loop.condition {
            Expression::Literal(lit) => Some(!lit.value.is_zero()),
            _ => None,
        };

        let condition = self.graph.make_block();
        let body = self.graph.make_block();
        let post = self.graph.make_block();
        let after = self.graph.make_block();

        let saved_loop = self.for_loop.replace(ForLoopInfo { after, post });

        match constant_condition {
            Some(true) => {
                // No condition check; the body loops unconditionally.
                self.jump(body, false);
                self.visit_block(&for_loop.body);
                self.jump(post, false);
                self.visit_block(&for_loop.post);
                self.jump(body, true);
            }
            Some(false) => {
                self.jump(after, false);
            }
            None => {
                self.jump(condition, false);
                let slot = self.visit_expr(&for_loop.condition);
                self.make_conditional_jump_to(slot, body, after);
                self.current = body;
                self.visit_block(&for_loop.body);
                self.jump(post, false);
                self.visit_block(&for_loop.post);
                self.jump(condition, true);
            }
        }

        self.for_loop = saved_loop;
        self.current = after;
    }

    fn visit_function_definition(&mut self, def: &ast::FunctionDefinition) {
        let func = self.functions_by_name[&def.name];
        let entry = self.graph.functions[func].entry;

        let exit = self.graph.make_block();
        self.graph.block_mut(exit).exit = BlockExit::FunctionReturn { function: func };

        // Function bodies lower in a fresh context; the surrounding loop
        // state must not leak in.
        let saved_current = self.current;
        let saved_exit = self.function_exit.replace(exit);
        let saved_loop = self.for_loop.take();

        self.current = entry;
        self.visit_block(&def.body);
        self.jump(exit, false);

        self.current = saved_current;
        self.function_exit = saved_exit;
        self.for_loop = saved_loop;
    }

    fn visit_expr(&mut self, expr: &Expression) -> StackSlot {
        match expr {
            Expression::Literal(lit) => StackSlot::Literal(lit.value),
            Expression::Identifier(ident) => StackSlot::Variable(ident.var),
            Expression::Call(call) => {
                let output = self.visit_call(call);
                assert_eq!(
                    output.len(),
                    1,
                    "call `{}` used as an expression must return one value",
                    call.callee
                );
                output[0]
            }
        }
    }

    /// Append the operation for a call and return its output slots.
    ///
    /// Arguments are evaluated right to left so the first argument ends up on
    /// top of the stack; nested calls append their operations first.
    fn visit_call(&mut self, call: &ast::FunctionCall) -> Stack {
        if let Some(builtin) = self.dialect.builtin(&call.callee) {
            let info = self.dialect.builtin_info(builtin);
            assert_eq!(
                call.args.len(),
                info.args,
                "wrong arity for builtin `{}`",
                call.callee
            );
            let returns = info.returns;

            let mut literal_args: SmallVec<[U256; 2]> = SmallVec::new();
            for (idx, arg) in call.args.iter().enumerate() {
                if !self.dialect.builtin_info(builtin).is_literal_argument(idx) {
                    continue;
                }
                let Expression::Literal(lit) = arg else {
                    panic!("literal argument of `{}` must be a literal", call.callee);
                };
                literal_args.push(lit.value);
            }

            let call_id = self.graph.calls.push(CallSite {
                callee: call.callee.clone(),
                returns,
                literal_args,
                span: call.span,
            });

            let mut input: Stack = Vec::new();
            for (idx, arg) in call.args.iter().enumerate().rev() {
                if self.dialect.builtin_info(builtin).is_literal_argument(idx) {
                    continue;
                }
                input.push(self.visit_expr(arg));
            }
            let args = input.len();
            let output: Stack = (0..returns)
                .map(|i| StackSlot::Temporary(call_id, i as u16))
                .collect();

            self.push_op(Operation {
                input,
                output: output.clone(),
                kind: OperationKind::BuiltinCall {
                    builtin,
                    call: call_id,
                    args,
                },
                span: call.span,
            });
            output
        } else {
            let func = *self
                .functions_by_name
                .get(&call.callee)
                .unwrap_or_else(|| panic!("unknown function `{}`", call.callee));
            let (params, returns) = {
                let info = &self.graph.functions[func];
                (info.parameters.len(), info.return_variables.len())
            };
            assert_eq!(
                call.args.len(),
                params,
                "wrong arity for function `{}`",
                call.callee
            );

            let call_id = self.graph.calls.push(CallSite {
                callee: call.callee.clone(),
                returns,
                literal_args: SmallVec::new(),
                span: call.span,
            });

            // The callee expects its return address below the arguments.
            let mut input: Stack = vec![StackSlot::CallReturnLabel(call_id)];
            for arg in call.args.iter().rev() {
                input.push(self.visit_expr(arg));
            }
            let output: Stack = (0..returns)
                .map(|i| StackSlot::Temporary(call_id, i as u16))
                .collect();

            self.push_op(Operation {
                input,
                output: output.clone(),
                kind: OperationKind::FunctionCall {
                    function: func,
                    call: call_id,
                },
                span: call.span,
            });
            output
        }
    }

    fn push_op(&mut self, op: Operation) {
        self.graph.block_mut(self.current).operations.push(op);
    }

    fn jump(&mut self, target: BlockId, backwards: bool) {
        self.graph.block_mut(self.current).exit = BlockExit::Jump { target, backwards };
        let current = self.current;
        self.graph.block_mut(target).entries.push(current);
        self.current = target;
    }

    fn make_conditional_jump(&mut self, condition: StackSlot) -> (BlockId, BlockId) {
        let non_zero = self.graph.make_block();
        let zero = self.graph.make_block();
        self.make_conditional_jump_to(condition, non_zero, zero);
        (non_zero, zero)
    }

    fn make_conditional_jump_to(
        &mut self,
        condition: StackSlot,
        non_zero: BlockId,
        zero: BlockId,
    ) {
        self.graph.block_mut(self.current).exit = BlockExit::ConditionalJump {
            condition,
            non_zero,
            zero,
        };
        let current = self.current;
        self.graph.block_mut(non_zero).entries.push(current);
        self.graph.block_mut(zero).entries.push(current);
    }
}

/// Remove references to blocks not reachable from the program entry or any
/// function entry. Surviving blocks keep only live predecessors; dead blocks
/// stay in the arena but are never referenced again.
fn prune_unreachable(graph: &mut Dfg) {
    let mut visited: FxHashSet<BlockId> = FxHashSet::default();
    let mut worklist: Vec<BlockId> = vec![graph.entry];
    worklist.extend(graph.functions.iter().map(|(_, info)| info.entry));

    while let Some(block) = worklist.pop() {
        if !visited.insert(block) {
            continue;
        }
        match graph.block(block).exit {
            BlockExit::Jump { target, .. } => worklist.push(target),
            BlockExit::ConditionalJump { non_zero, zero, .. } => {
                worklist.push(zero);
                worklist.push(non_zero);
            }
            BlockExit::MainExit | BlockExit::Terminated | BlockExit::FunctionReturn { .. } => {}
        }
    }

    let dead: Vec<BlockId> = graph
        .blocks
        .keys()
        .filter(|block| !visited.contains(block))
        .collect();
    for &block in &visited {
        graph
            .block_mut(block)
            .entries
            .retain(|entry| visited.contains(entry));
    }
    for block in dead {
        *graph.block_mut(block) = BasicBlock::default();
    }
}
