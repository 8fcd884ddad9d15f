/**
 * DISPATCH - Résolution de surcharge pour l'invocation distante
 *
 * RÔLE : L'invocation pilotée par réflexion du modèle d'origine devient une
 * capacité explicite : la signature est résolue une fois contre les méthodes
 * déclarées du descripteur, puis mise en cache par le proxy d'hôte.
 * La résolution est une fonction pure, testable indépendamment.
 */

use crate::models::{MethodDescriptor, ParamKind};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no method named `{0}` accepts the given arguments")]
    NoMatch(String),

    #[error("ambiguous call to `{0}`: multiple overloads match equally well")]
    Ambiguous(String),
}

impl ParamKind {
    pub fn matches(&self, arg: &Value) -> bool {
        match self {
            ParamKind::Any => true,
            ParamKind::Bool => arg.is_boolean(),
            ParamKind::Number => arg.is_number(),
            ParamKind::String => arg.is_string(),
            ParamKind::Array => arg.is_array(),
            ParamKind::Object => arg.is_object(),
        }
    }
}

/// Score de spécificité : nombre de paramètres à correspondance exacte
/// (un `Any` accepte mais ne compte pas).
fn specificity(method: &MethodDescriptor) -> usize {
    method
        .params
        .iter()
        .filter(|p| !matches!(p, ParamKind::Any))
        .count()
}

/// Résout la surcharge applicable : filtre par nom, arité puis compatibilité
/// des sortes d'arguments ; départage par spécificité. Deux candidates
/// également spécifiques donnent une erreur d'ambiguïté, jamais un choix
/// arbitraire.
pub fn resolve_overload<'a>(
    methods: &'a [MethodDescriptor],
    name: &str,
    args: &[Value],
) -> Result<&'a MethodDescriptor, DispatchError> {
    let mut best: Option<&MethodDescriptor> = None;
    let mut best_score = 0usize;
    let mut tie = false;

    for method in methods {
        if method.name != name || method.params.len() != args.len() {
            continue;
        }
        if !method.params.iter().zip(args).all(|(p, a)| p.matches(a)) {
            continue;
        }
        let score = specificity(method);
        match best {
            None => {
                best = Some(method);
                best_score = score;
            }
            Some(_) if score > best_score => {
                best = Some(method);
                best_score = score;
                tie = false;
            }
            Some(_) if score == best_score => tie = true,
            Some(_) => {}
        }
    }

    match best {
        None => Err(DispatchError::NoMatch(name.to_string())),
        Some(_) if tie => Err(DispatchError::Ambiguous(name.to_string())),
        Some(m) => Ok(m),
    }
}
