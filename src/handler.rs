use hashbrown::HashMap;

use crate::{arbiter::ArbiterId, space::Space};

/// User-chosen category a shape belongs to for handler dispatch.
pub type CollisionType = u32;

/// Collision type matching any other type in a handler registration.
pub const WILDCARD_COLLISION_TYPE: CollisionType = CollisionType::MAX;

/// Callback deciding whether a new collision is accepted.
pub type BeginFn = Box<dyn FnMut(&mut Space, ArbiterId) -> bool>;
/// Callback deciding whether a collision is solved this step.
pub type PreSolveFn = Box<dyn FnMut(&mut Space, ArbiterId) -> bool>;
/// Callback observing a collision after the solver ran.
pub type PostSolveFn = Box<dyn FnMut(&mut Space, ArbiterId)>;
/// Callback observing the end of a collision.
pub type SeparateFn = Box<dyn FnMut(&mut Space, ArbiterId)>;

/// Set of callbacks fired over the lifetime of a collision.
///
/// Any callback can be left out, a missing begin or pre-solve counts as an
/// accept.
pub struct CollisionHandler {
    /// Collision type of the first shape.
    pub type_a: CollisionType,
    /// Collision type of the second shape, may be [`WILDCARD_COLLISION_TYPE`].
    pub type_b: CollisionType,
    /// Fired once when two shapes start touching, returning whether the
    /// collision is accepted for its whole lifetime.
    pub begin: Option<BeginFn>,
    /// Fired every step two shapes touch, returning whether the collision is
    /// solved this step.
    pub pre_solve: Option<PreSolveFn>,
    /// Fired every step after the solver ran.
    pub post_solve: Option<PostSolveFn>,
    /// Fired once when two shapes stop touching, or when the pair expires.
    pub separate: Option<SeparateFn>,
}

impl CollisionHandler {
    /// Empty handler for a pair of collision types.
    pub fn new(type_a: CollisionType, type_b: CollisionType) -> Self {
        Self {
            type_a,
            type_b,
            begin: None,
            pre_solve: None,
            post_solve: None,
            separate: None,
        }
    }

    /// Empty handler matching every collision of a single type.
    pub fn new_wildcard(type_a: CollisionType) -> Self {
        Self::new(type_a, WILDCARD_COLLISION_TYPE)
    }
}

/// Which registry slot an arbiter resolved a handler from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerKey {
    /// Keyed pair registration, also used for wildcard registrations.
    Pair(CollisionType, CollisionType),
    /// The catch-all handler.
    Default,
}

/// Handlers resolved for an arbiter, in dispatch order.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HandlerSet {
    /// Handler registered for the pair, or the default handler.
    pub(crate) specific: Option<HandlerKey>,
    /// Wildcard handler of the first type.
    pub(crate) wildcard_a: Option<HandlerKey>,
    /// Wildcard handler of the second type.
    pub(crate) wildcard_b: Option<HandlerKey>,
}

impl HandlerSet {
    /// Keys in dispatch order.
    pub(crate) fn keys(&self) -> impl Iterator<Item = HandlerKey> {
        [self.specific, self.wildcard_a, self.wildcard_b]
            .into_iter()
            .flatten()
    }
}

/// Registry of collision handlers keyed by ordered type pairs.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    /// Pair and wildcard registrations.
    pairs: HashMap<(CollisionType, CollisionType), CollisionHandler>,
    /// Catch-all handler backing unregistered pairs.
    default: Option<CollisionHandler>,
}

impl HandlerRegistry {
    /// Register a handler, replacing a previous registration of the same pair.
    pub(crate) fn add(&mut self, handler: CollisionHandler) {
        self.pairs
            .insert((handler.type_a, handler.type_b), handler);
    }

    /// Register the catch-all handler.
    pub(crate) fn add_default(&mut self, handler: CollisionHandler) {
        self.default = Some(handler);
    }

    /// Resolve the handlers for a pair of collision types.
    ///
    /// Returns the resolved set and whether the pair order was swapped to
    /// match the registration order.
    pub(crate) fn lookup(&self, type_a: CollisionType, type_b: CollisionType) -> (HandlerSet, bool) {
        let (specific, swapped) = if self.pairs.contains_key(&(type_a, type_b)) {
            (Some(HandlerKey::Pair(type_a, type_b)), false)
        } else if self.pairs.contains_key(&(type_b, type_a)) {
            (Some(HandlerKey::Pair(type_b, type_a)), true)
        } else if self.default.is_some() {
            (Some(HandlerKey::Default), false)
        } else {
            (None, false)
        };

        // The pair swap also swaps which side the wildcards apply to.
        let (first, second) = if swapped {
            (type_b, type_a)
        } else {
            (type_a, type_b)
        };

        let wildcard = |collision_type| {
            let key = (collision_type, WILDCARD_COLLISION_TYPE);
            self.pairs.contains_key(&key).then_some(HandlerKey::Pair(
                collision_type,
                WILDCARD_COLLISION_TYPE,
            ))
        };

        (
            HandlerSet {
                specific,
                wildcard_a: wildcard(first),
                wildcard_b: wildcard(second),
            },
            swapped,
        )
    }

    /// Access a handler by its resolved key.
    pub(crate) fn get_mut(&mut self, key: HandlerKey) -> Option<&mut CollisionHandler> {
        match key {
            HandlerKey::Pair(type_a, type_b) => self.pairs.get_mut(&(type_a, type_b)),
            HandlerKey::Default => self.default.as_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CollisionHandler, HandlerKey, HandlerRegistry};

    /// Pair lookups match either shape order.
    #[test]
    fn test_lookup_swapped() {
        let mut registry = HandlerRegistry::default();
        registry.add(CollisionHandler::new(1, 2));

        let (set, swapped) = registry.lookup(1, 2);
        assert_eq!(set.specific, Some(HandlerKey::Pair(1, 2)));
        assert!(!swapped);

        let (set, swapped) = registry.lookup(2, 1);
        assert_eq!(set.specific, Some(HandlerKey::Pair(1, 2)));
        assert!(swapped);
    }

    /// Wildcards resolve next to a specific registration.
    #[test]
    fn test_lookup_wildcards() {
        let mut registry = HandlerRegistry::default();
        registry.add(CollisionHandler::new(1, 2));
        registry.add(CollisionHandler::new_wildcard(2));

        let (set, _) = registry.lookup(1, 2);
        assert!(set.wildcard_a.is_none());
        assert!(set.wildcard_b.is_some());
        assert_eq!(set.keys().count(), 2);
    }

    /// Unregistered pairs fall back to the default handler when present.
    #[test]
    fn test_lookup_default() {
        let mut registry = HandlerRegistry::default();
        assert_eq!(registry.lookup(4, 5).0.keys().count(), 0);

        registry.add_default(CollisionHandler::new(0, 0));
        let (set, swapped) = registry.lookup(4, 5);
        assert_eq!(set.specific, Some(HandlerKey::Default));
        assert!(!swapped);
    }
}
