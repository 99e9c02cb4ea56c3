//! Typed access to leaves.

use crate::error::TreeError;
use crate::node::{NodeKey, NodeKind, SubscriptionId};
use crate::path::NodePath;
use crate::pending::TypedGet;
use crate::tree::{SetOutcome, StateTree};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// A leaf key paired with its value type.
pub struct LeafHandle<T> {
    key: NodeKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for LeafHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for LeafHandle<T> {}

impl<T> std::fmt::Debug for LeafHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LeafHandle").field(&self.key).finish()
    }
}

impl<T> LeafHandle<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Resolve a leaf by path.
    ///
    /// # Errors
    ///
    /// Returns `PathNotFound` or `WrongKind` if the path is not a leaf.
    pub fn resolve(tree: &StateTree, path: impl Into<NodePath>) -> Result<Self, TreeError> {
        let key = tree.resolve(path)?;
        match tree.node(key).map(|n| n.kind()) {
            Some(NodeKind::Leaf(_)) => Ok(Self {
                key,
                _marker: PhantomData,
            }),
            Some(other) => Err(TreeError::WrongKind {
                path: tree.full_name(key),
                expected: "leaf",
                actual: other.name(),
            }),
            None => Err(TreeError::UnknownNode),
        }
    }

    /// The underlying key.
    #[must_use]
    pub fn key(&self) -> NodeKey {
        self.key
    }

    /// Read the leaf, decoding as `T`.
    ///
    /// # Errors
    ///
    /// See [`StateTree::get`].
    pub fn get(&self, tree: &mut StateTree) -> Result<TypedGet<T>, TreeError> {
        Ok(tree.get(self.key)?.typed())
    }

    /// The locally held value, without subscribing.
    ///
    /// # Errors
    ///
    /// Returns `Value` if the stored value does not decode as `T`.
    pub fn peek(&self, tree: &StateTree) -> Result<Option<T>, TreeError> {
        tree.value(self.key)?
            .map(|v| serde_json::from_value(v.clone()).map_err(|e| TreeError::Value(e.to_string())))
            .transpose()
    }

    /// Write the leaf as the local actor.
    ///
    /// # Errors
    ///
    /// Returns `Value` if `value` does not serialize, otherwise see
    /// [`StateTree::set`].
    pub fn set(&self, tree: &mut StateTree, value: &T) -> Result<SetOutcome, TreeError> {
        let value = serde_json::to_value(value).map_err(|e| TreeError::Value(e.to_string()))?;
        tree.set(self.key, value)
    }

    /// Observe decoded values. Values that fail to decode are logged and skipped.
    ///
    /// # Errors
    ///
    /// See [`StateTree::subscribe`].
    pub fn subscribe<F>(
        &self,
        tree: &mut StateTree,
        mut callback: F,
    ) -> Result<SubscriptionId, TreeError>
    where
        T: 'static,
        F: FnMut(T) + Send + 'static,
    {
        tree.subscribe(self.key, move |value| match serde_json::from_value::<T>(value.clone()) {
            Ok(decoded) => callback(decoded),
            Err(err) => tracing::warn!(error = %err, "Leaf value did not decode"),
        })
    }
}
