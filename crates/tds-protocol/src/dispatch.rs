//! Token dispatch.
//!
//! A [`TokenRegistry`] maps each tag byte to a parser function. The standard
//! registry covers every token the client understands; callers can build
//! their own to add or replace parsers. A [`TokenDispatcher`] pairs a
//! registry with a [`ParseContext`] and walks a buffer token by token.

use std::sync::{Arc, LazyLock};

use bytes::{Buf, Bytes};

use crate::error::ProtocolError;
use crate::token::{
    decode_long_counted, decode_ushort_counted, ColMetaData, Done, EnvChange, FeatureExtAck,
    LoginAck, Order, ParseContext, ReturnValue, RowData, ServerMessage, Token, TokenType,
};
use crate::version::TdsVersion;

/// Parser for one token body. The tag has already been consumed.
pub type TokenParserFn = fn(&mut Bytes, u8, &ParseContext) -> Result<Token, ProtocolError>;

/// Tag-indexed table of token parsers.
#[derive(Clone)]
pub struct TokenRegistry {
    parsers: [Option<TokenParserFn>; 256],
}

static STANDARD: LazyLock<Arc<TokenRegistry>> =
    LazyLock::new(|| Arc::new(TokenRegistry::build_standard()));

impl TokenRegistry {
    /// A registry with no parsers.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            parsers: [None; 256],
        }
    }

    /// The shared registry with all standard tokens.
    #[must_use]
    pub fn standard() -> Arc<Self> {
        Arc::clone(&STANDARD)
    }

    fn build_standard() -> Self {
        let mut registry = Self::empty();
        registry.register(TokenType::ColMetaData as u8, parse_colmetadata);
        registry.register(TokenType::Row as u8, parse_row);
        registry.register(TokenType::NbcRow as u8, parse_nbc_row);
        registry.register(TokenType::Done as u8, parse_done);
        registry.register(TokenType::DoneProc as u8, parse_done);
        registry.register(TokenType::DoneInProc as u8, parse_done);
        registry.register(TokenType::ReturnStatus as u8, parse_return_status);
        registry.register(TokenType::ReturnValue as u8, parse_return_value);
        registry.register(TokenType::Error as u8, parse_message);
        registry.register(TokenType::Info as u8, parse_message);
        registry.register(TokenType::LoginAck as u8, parse_login_ack);
        registry.register(TokenType::EnvChange as u8, parse_env_change);
        registry.register(TokenType::Order as u8, parse_order);
        registry.register(TokenType::FeatureExtAck as u8, parse_feature_ext_ack);
        registry.register(TokenType::Sspi as u8, parse_sspi);
        registry.register(TokenType::SessionState as u8, parse_session_state);
        registry.register(TokenType::FedAuthInfo as u8, parse_fed_auth_info);
        registry
    }

    /// Install `parser` for `tag`, replacing any previous one.
    pub fn register(&mut self, tag: u8, parser: TokenParserFn) -> &mut Self {
        self.parsers[tag as usize] = Some(parser);
        self
    }

    /// The parser for `tag`, if any.
    #[must_use]
    pub fn get(&self, tag: u8) -> Option<TokenParserFn> {
        self.parsers[tag as usize]
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::build_standard()
    }
}

impl std::fmt::Debug for TokenRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered = self.parsers.iter().filter(|p| p.is_some()).count();
        f.debug_struct("TokenRegistry")
            .field("registered", &registered)
            .finish()
    }
}

fn parse_colmetadata(
    src: &mut Bytes,
    _tag: u8,
    ctx: &ParseContext,
) -> Result<Token, ProtocolError> {
    Ok(Token::ColMetaData(Arc::new(ColMetaData::decode(
        src,
        ctx.version,
    )?)))
}

fn parse_row(src: &mut Bytes, _tag: u8, ctx: &ParseContext) -> Result<Token, ProtocolError> {
    let metadata = ctx.require_metadata()?;
    Ok(Token::Row(RowData::decode(src, metadata)?))
}

fn parse_nbc_row(src: &mut Bytes, _tag: u8, ctx: &ParseContext) -> Result<Token, ProtocolError> {
    let metadata = ctx.require_metadata()?;
    Ok(Token::Row(RowData::decode_nbc(src, metadata)?))
}

fn parse_done(src: &mut Bytes, tag: u8, ctx: &ParseContext) -> Result<Token, ProtocolError> {
    let done = Done::decode(src, ctx.version)?;
    Ok(match TokenType::from_u8(tag) {
        Some(TokenType::DoneProc) => Token::DoneProc(done),
        Some(TokenType::DoneInProc) => Token::DoneInProc(done),
        _ => Token::Done(done),
    })
}

fn parse_return_status(
    src: &mut Bytes,
    _tag: u8,
    _ctx: &ParseContext,
) -> Result<Token, ProtocolError> {
    crate::codec::ensure(src, 4)?;
    Ok(Token::ReturnStatus(src.get_i32_le()))
}

fn parse_return_value(
    src: &mut Bytes,
    _tag: u8,
    ctx: &ParseContext,
) -> Result<Token, ProtocolError> {
    Ok(Token::ReturnValue(ReturnValue::decode(src, ctx.version)?))
}

fn parse_message(src: &mut Bytes, tag: u8, ctx: &ParseContext) -> Result<Token, ProtocolError> {
    let message = ServerMessage::decode(src, ctx.version)?;
    Ok(if tag == TokenType::Error as u8 {
        Token::Error(message)
    } else {
        Token::Info(message)
    })
}

fn parse_login_ack(src: &mut Bytes, _tag: u8, _ctx: &ParseContext) -> Result<Token, ProtocolError> {
    Ok(Token::LoginAck(LoginAck::decode(src)?))
}

fn parse_env_change(src: &mut Bytes, _tag: u8, ctx: &ParseContext) -> Result<Token, ProtocolError> {
    Ok(Token::EnvChange(EnvChange::decode(src, ctx.version)?))
}

fn parse_order(src: &mut Bytes, _tag: u8, _ctx: &ParseContext) -> Result<Token, ProtocolError> {
    Ok(Token::Order(Order::decode(src)?))
}

fn parse_feature_ext_ack(
    src: &mut Bytes,
    _tag: u8,
    _ctx: &ParseContext,
) -> Result<Token, ProtocolError> {
    Ok(Token::FeatureExtAck(FeatureExtAck::decode(src)?))
}

fn parse_sspi(src: &mut Bytes, _tag: u8, _ctx: &ParseContext) -> Result<Token, ProtocolError> {
    Ok(Token::Sspi(decode_ushort_counted(src)?))
}

fn parse_session_state(
    src: &mut Bytes,
    _tag: u8,
    _ctx: &ParseContext,
) -> Result<Token, ProtocolError> {
    Ok(Token::SessionState(decode_long_counted(src)?))
}

fn parse_fed_auth_info(
    src: &mut Bytes,
    _tag: u8,
    _ctx: &ParseContext,
) -> Result<Token, ProtocolError> {
    Ok(Token::FedAuthInfo(decode_long_counted(src)?))
}

/// Walks a token buffer with a registry and a parse context.
#[derive(Debug, Clone)]
pub struct TokenDispatcher {
    registry: Arc<TokenRegistry>,
    ctx: ParseContext,
}

impl TokenDispatcher {
    /// Dispatcher over the standard registry.
    #[must_use]
    pub fn new(version: TdsVersion) -> Self {
        Self::with_registry(TokenRegistry::standard(), version)
    }

    /// Dispatcher over a custom registry.
    #[must_use]
    pub fn with_registry(registry: Arc<TokenRegistry>, version: TdsVersion) -> Self {
        Self {
            registry,
            ctx: ParseContext::new(version),
        }
    }

    /// Current parse context.
    #[must_use]
    pub fn context(&self) -> &ParseContext {
        &self.ctx
    }

    /// Change the version used for subsequent tokens.
    pub fn set_version(&mut self, version: TdsVersion) {
        self.ctx.version = version;
    }

    /// Forget the active result set.
    pub fn clear_metadata(&mut self) {
        self.ctx.metadata = None;
    }

    /// Parse the next token from `buf`.
    ///
    /// Returns `Ok(None)` when `buf` is empty. On success the token's bytes
    /// are consumed; on error `buf` is left untouched, so an
    /// [`ProtocolError::UnexpectedEof`] can be retried once more data has
    /// arrived.
    pub fn parse_next(&mut self, buf: &mut Bytes) -> Result<Option<Token>, ProtocolError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let mut cursor = buf.clone();
        let tag = cursor.get_u8();
        let parser = self
            .registry
            .get(tag)
            .ok_or(ProtocolError::UnknownToken(tag))?;
        let token = parser(&mut cursor, tag, &self.ctx)?;

        if let Token::ColMetaData(meta) = &token {
            // An empty COLMETADATA keeps the previous result set's columns.
            if !meta.is_empty() {
                self.ctx.metadata = Some(Arc::clone(meta));
            }
        }

        *buf = cursor;
        Ok(Some(token))
    }

    /// Parse every token in a complete message.
    pub fn parse_all(&mut self, mut buf: Bytes) -> Result<Vec<Token>, ProtocolError> {
        let mut tokens = Vec::new();
        while let Some(token) = self.parse_next(&mut buf)? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    /// Iterate over the tokens of a complete message.
    pub fn stream(&mut self, buf: Bytes) -> TokenStream<'_> {
        TokenStream {
            dispatcher: self,
            buf,
            failed: false,
        }
    }
}

/// Iterator over the tokens of one complete message.
///
/// Yields at most one error, then stops.
#[derive(Debug)]
pub struct TokenStream<'a> {
    dispatcher: &'a mut TokenDispatcher,
    buf: Bytes,
    failed: bool,
}

impl TokenStream<'_> {
    /// Bytes not yet parsed.
    #[must_use]
    pub fn remaining(&self) -> &Bytes {
        &self.buf
    }
}

impl Iterator for TokenStream<'_> {
    type Item = Result<Token, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.dispatcher.parse_next(&mut self.buf) {
            Ok(token) => token.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::token::{ColumnMeta, TokenType};
    use crate::types::TypeId;
    use bytes::BytesMut;

    fn int_metadata() -> ColMetaData {
        ColMetaData::new(vec![ColumnMeta::new("n", TypeId::IntN).with_max_length(4)])
    }

    fn result_set(rows: &[i32]) -> Bytes {
        let meta = int_metadata();
        let mut buf = BytesMut::new();
        meta.encode(&mut buf);
        for n in rows {
            RowData {
                values: vec![Some(Bytes::copy_from_slice(&n.to_le_bytes()))],
            }
            .encode(&mut buf, &meta);
        }
        Done::new(Some(rows.len() as u64)).encode(&mut buf, TokenType::Done, TdsVersion::V7_4);
        buf.freeze()
    }

    #[test]
    fn test_standard_registry_covers_tokens() {
        let registry = TokenRegistry::standard();
        for tag in [0x79, 0x81, 0xA9, 0xAA, 0xAB, 0xAC, 0xAD, 0xAE, 0xD1, 0xD2, 0xE3, 0xFD, 0xFE, 0xFF] {
            assert!(registry.get(tag).is_some(), "missing parser for {tag:#04x}");
        }
        assert!(registry.get(0x00).is_none());
    }

    #[test]
    fn test_parse_result_set() {
        let mut dispatcher = TokenDispatcher::new(TdsVersion::V7_4);
        let tokens = dispatcher.parse_all(result_set(&[1, 2, 3])).unwrap();
        assert_eq!(tokens.len(), 5);
        assert!(matches!(tokens[0], Token::ColMetaData(_)));
        match &tokens[2] {
            Token::Row(row) => assert_eq!(row.get(0).unwrap().as_ref(), &2i32.to_le_bytes()),
            other => panic!("expected row, got {other:?}"),
        }
        assert_eq!(tokens[4].as_done().unwrap().count(), Some(3));
    }

    #[test]
    fn test_row_without_metadata() {
        let mut dispatcher = TokenDispatcher::new(TdsVersion::V7_4);
        let mut buf = Bytes::from_static(&[0xD1, 0x04, 1, 0, 0, 0]);
        assert_eq!(
            dispatcher.parse_next(&mut buf).unwrap_err(),
            ProtocolError::MissingColumnMetadata
        );
    }

    #[test]
    fn test_unknown_token_is_fatal() {
        let mut dispatcher = TokenDispatcher::new(TdsVersion::V7_4);
        let mut buf = Bytes::from_static(&[0x42, 0x00]);
        assert_eq!(
            dispatcher.parse_next(&mut buf).unwrap_err(),
            ProtocolError::UnknownToken(0x42)
        );
    }

    #[test]
    fn test_partial_token_leaves_buffer() {
        let full = result_set(&[7]);
        let mut dispatcher = TokenDispatcher::new(TdsVersion::V7_4);

        let mut partial = full.slice(..full.len() - 3);
        dispatcher.parse_next(&mut partial).unwrap();
        dispatcher.parse_next(&mut partial).unwrap();
        let before = partial.len();
        assert_eq!(
            dispatcher.parse_next(&mut partial).unwrap_err(),
            ProtocolError::UnexpectedEof
        );
        assert_eq!(partial.len(), before);
    }

    #[test]
    fn test_custom_registry_override() {
        fn swallow(src: &mut Bytes, _tag: u8, _ctx: &ParseContext) -> Result<Token, ProtocolError> {
            crate::codec::ensure(src, 1)?;
            Ok(Token::ReturnStatus(i32::from(src.get_u8())))
        }

        let mut registry = TokenRegistry::empty();
        registry.register(0x42, swallow);
        let mut dispatcher = TokenDispatcher::with_registry(Arc::new(registry), TdsVersion::V7_4);
        let tokens = dispatcher.parse_all(Bytes::from_static(&[0x42, 0x05])).unwrap();
        assert!(matches!(tokens[0], Token::ReturnStatus(5)));
    }

    #[test]
    fn test_version_changes_done_width() {
        let mut buf = BytesMut::new();
        Done::new(Some(9)).encode(&mut buf, TokenType::DoneProc, TdsVersion::V7_1);
        let mut dispatcher = TokenDispatcher::new(TdsVersion::V7_1);
        let tokens = dispatcher.parse_all(buf.freeze()).unwrap();
        assert!(matches!(tokens[0], Token::DoneProc(d) if d.row_count == 9));
    }

    #[test]
    fn test_stream_stops_after_error() {
        let mut dispatcher = TokenDispatcher::new(TdsVersion::V7_4);
        let mut buf = BytesMut::from(&result_set(&[1])[..]);
        buf.extend_from_slice(&[0x42]);
        let items: Vec<_> = dispatcher.stream(buf.freeze()).collect();
        assert_eq!(items.len(), 4);
        assert!(items[3].is_err());
    }
}
