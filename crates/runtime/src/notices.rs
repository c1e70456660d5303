//! Stable user-visible strings.
//!
//! Root causes never reach chat posts; they are logged with the request id
//! and the user sees one of these instead.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// Any upstream, protocol or internal failure.
    GenericError,
    Cancelled,
    PermissionDenied,
    ToolDepthExceeded,
}

/// Text for `notice` in `locale` (`de`, `de-DE`, `de_DE` ...). Unknown
/// locales fall back to English.
pub fn text(notice: Notice, locale: &str) -> &'static str {
    let lang = locale
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match (lang.as_str(), notice) {
        ("de", Notice::GenericError) => "Beim Erstellen der Antwort ist ein Fehler aufgetreten.",
        ("de", Notice::Cancelled) => "_Antwort abgebrochen._",
        ("de", Notice::PermissionDenied) => "Du hast keine Berechtigung, diesen Bot hier zu verwenden.",
        ("de", Notice::ToolDepthExceeded) => "Zu viele aufeinanderfolgende Tool-Aufrufe. Bitte stelle die Frage neu.",
        ("fr", Notice::GenericError) => "Une erreur s'est produite lors de la génération de la réponse.",
        ("fr", Notice::Cancelled) => "_Réponse annulée._",
        ("fr", Notice::PermissionDenied) => "Vous n'êtes pas autorisé à utiliser ce bot ici.",
        ("fr", Notice::ToolDepthExceeded) => "Trop d'appels d'outils successifs. Veuillez reformuler la question.",
        ("es", Notice::GenericError) => "Se produjo un error al generar la respuesta.",
        ("es", Notice::Cancelled) => "_Respuesta cancelada._",
        ("es", Notice::PermissionDenied) => "No tienes permiso para usar este bot aquí.",
        ("es", Notice::ToolDepthExceeded) => "Demasiadas llamadas a herramientas seguidas. Vuelve a formular la pregunta.",
        (_, Notice::GenericError) => "Sorry! An error occurred while generating the response.",
        (_, Notice::Cancelled) => "_Response cancelled._",
        (_, Notice::PermissionDenied) => "You don't have permission to use this bot here.",
        (_, Notice::ToolDepthExceeded) => "Too many tool calls in a row. Please ask again.",
    }
}

/// The notice shown for a failed completion.
pub fn for_error(err: &tm_domain::error::Error, locale: &str) -> &'static str {
    use tm_domain::error::Error;
    match err {
        Error::Permission(_) => text(Notice::PermissionDenied, locale),
        Error::Cancelled => text(Notice::Cancelled, locale),
        Error::DepthExceeded => text(Notice::ToolDepthExceeded, locale),
        _ => text(Notice::GenericError, locale),
    }
}
