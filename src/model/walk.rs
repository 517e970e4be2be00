//! Lazy, deterministic, restartable traversal over a plan's tree in
//! execution order:
//!
//! `Plan -> Bypass -> Pre -> Cont -> Blocks(each: Bypass, Pre, Cont,
//! Sequences -> Actions, Post, Deferred) -> Post -> Deferred`

use super::id::EntityId;
use super::plan::{Action, Block, Checks, Plan, Sequence};

/// A reference to one entity visited by a [`Walk`].
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    Plan(&'a Plan),
    Checks(&'a Checks),
    Block(&'a Block),
    Sequence(&'a Sequence),
    Action(&'a Action),
}

impl<'a> Node<'a> {
    pub fn id(&self) -> EntityId {
        match self {
            Node::Plan(p) => p.id,
            Node::Checks(c) => c.id,
            Node::Block(b) => b.id,
            Node::Sequence(s) => s.id,
            Node::Action(a) => a.id,
        }
    }

    /// The owning plan id. Every entity except `Plan` exposes one.
    pub fn plan_id(&self) -> Option<EntityId> {
        match self {
            Node::Plan(_) => None,
            Node::Checks(c) => Some(c.plan_id),
            Node::Block(b) => Some(b.plan_id),
            Node::Sequence(s) => Some(s.plan_id),
            Node::Action(a) => Some(a.plan_id),
        }
    }
}

/// One produced item: the visited value plus the ancestor path leading to
/// it (not including the value itself).
#[derive(Debug, Clone)]
pub struct WalkItem<'a> {
    pub value: Node<'a>,
    pub chain: Vec<Node<'a>>,
}

enum Pending<'a> {
    Plan(&'a Plan),
    Checks(&'a Checks, Vec<Node<'a>>),
    Block(&'a Block, Vec<Node<'a>>),
    Sequence(&'a Sequence, Vec<Node<'a>>),
    Action(&'a Action, Vec<Node<'a>>),
}

/// Pull-based traversal. Each call to `next()` expands exactly one level of
/// the tree; dropping the iterator mid-traversal releases the remaining
/// stack immediately — there is nothing else to clean up.
pub struct Walk<'a> {
    stack: Vec<Pending<'a>>,
}

impl<'a> Walk<'a> {
    pub fn new(plan: &'a Plan) -> Self {
        Self {
            stack: vec![Pending::Plan(plan)],
        }
    }
}

/// Push `checks`/block tails in the declared Bypass/Pre/Cont/.../Deferred
/// order, onto a LIFO stack, so popping yields that same order.
fn push_checks_tail<'a>(
    stack: &mut Vec<Pending<'a>>,
    chain: &[Node<'a>],
    deferred: &'a Option<Checks>,
    post: &'a Option<Checks>,
) {
    if let Some(d) = deferred {
        stack.push(Pending::Checks(d, chain.to_vec()));
    }
    if let Some(p) = post {
        stack.push(Pending::Checks(p, chain.to_vec()));
    }
}

fn push_checks_head<'a>(
    stack: &mut Vec<Pending<'a>>,
    chain: &[Node<'a>],
    cont: &'a Option<Checks>,
    pre: &'a Option<Checks>,
    bypass: &'a Option<Checks>,
) {
    if let Some(c) = cont {
        stack.push(Pending::Checks(c, chain.to_vec()));
    }
    if let Some(p) = pre {
        stack.push(Pending::Checks(p, chain.to_vec()));
    }
    if let Some(b) = bypass {
        stack.push(Pending::Checks(b, chain.to_vec()));
    }
}

impl<'a> Iterator for Walk<'a> {
    type Item = WalkItem<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let pending = self.stack.pop()?;

        Some(match pending {
            Pending::Plan(plan) => {
                let mut child_chain = Vec::with_capacity(1);
                child_chain.push(Node::Plan(plan));

                push_checks_tail(&mut self.stack, &child_chain, &plan.deferred, &plan.post);
                for block in plan.blocks.iter().rev() {
                    self.stack.push(Pending::Block(block, child_chain.clone()));
                }
                push_checks_head(&mut self.stack, &child_chain, &plan.cont, &plan.pre, &plan.bypass);

                WalkItem {
                    value: Node::Plan(plan),
                    chain: Vec::new(),
                }
            }

            Pending::Block(block, chain) => {
                let mut child_chain = chain.clone();
                child_chain.push(Node::Block(block));

                push_checks_tail(&mut self.stack, &child_chain, &block.deferred, &block.post);
                for seq in block.sequences.iter().rev() {
                    self.stack
                        .push(Pending::Sequence(seq, child_chain.clone()));
                }
                push_checks_head(&mut self.stack, &child_chain, &block.cont, &block.pre, &block.bypass);

                WalkItem {
                    value: Node::Block(block),
                    chain,
                }
            }

            Pending::Checks(checks, chain) => {
                let mut child_chain = chain.clone();
                child_chain.push(Node::Checks(checks));
                for action in checks.actions.iter().rev() {
                    self.stack
                        .push(Pending::Action(action, child_chain.clone()));
                }

                WalkItem {
                    value: Node::Checks(checks),
                    chain,
                }
            }

            Pending::Sequence(seq, chain) => {
                let mut child_chain = chain.clone();
                child_chain.push(Node::Sequence(seq));
                for action in seq.actions.iter().rev() {
                    self.stack
                        .push(Pending::Action(action, child_chain.clone()));
                }

                WalkItem {
                    value: Node::Sequence(seq),
                    chain,
                }
            }

            Pending::Action(action, chain) => WalkItem {
                value: Node::Action(action),
                chain,
            },
        })
    }
}
