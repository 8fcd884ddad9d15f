/**
 * CANCELLATION TOKEN - Annulation coopérative des appels bloquants
 *
 * RÔLE : Booléen write-once, éventuellement parenté. Une fois annulé, l'état
 * est permanent et se propage du parent vers les enfants. Les opérations
 * longues le consultent périodiquement.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crée un token enfant : annulé dès que le parent l'est.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().map(|p| p.is_cancelled()).unwrap_or(false)
    }

    /// Évite à l'appelant le double test Option + annulation.
    pub fn is_cancelled_opt(token: Option<&CancelToken>) -> bool {
        token.map(|t| t.is_cancelled()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_permanent() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        // pas de désannulation possible
        assert!(token.is_cancelled());
    }

    #[test]
    fn clone_shares_state() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn parent_propagates_to_child() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_does_not_propagate_to_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn optional_helper() {
        assert!(!CancelToken::is_cancelled_opt(None));
        let token = CancelToken::new();
        token.cancel();
        assert!(CancelToken::is_cancelled_opt(Some(&token)));
    }
}
