use parking_lot::RwLock;
use riptide_channel::Token;

/// Supplies the credential used to open the channel.
pub trait CredentialProvider: Send + Sync {
    fn current_token(&self) -> Option<Token>;
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Option<Token> + Send + Sync,
{
    fn current_token(&self) -> Option<Token> {
        (self)()
    }
}

/// A credential that can be swapped at runtime, e.g. after a login or a
/// token refresh. Starts empty unless built with [`SharedToken::with_token`].
#[derive(Debug, Default)]
pub struct SharedToken {
    token: RwLock<Option<Token>>,
}

impl SharedToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(Token::new(token))),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write() = Some(Token::new(token));
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

impl CredentialProvider for SharedToken {
    fn current_token(&self) -> Option<Token> {
        self.token.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_token_can_be_replaced_and_cleared() {
        let creds = SharedToken::new();
        assert_eq!(creds.current_token(), None);
        creds.set("abc");
        assert_eq!(creds.current_token(), Some(Token::new("abc")));
        creds.clear();
        assert_eq!(creds.current_token(), None);
    }

    #[test]
    fn closures_are_providers() {
        let provider = || Some(Token::new("from-closure"));
        assert_eq!(
            CredentialProvider::current_token(&provider),
            Some(Token::new("from-closure"))
        );
    }
}
