use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};
use tinyvec::ArrayVec;

use super::{CipherSuite, CompressionMethod, Cookie, ProtocolVersion, Random, SessionId};

/// secp256r1 in the supported_groups extension.
pub const NAMED_CURVE_SECP256R1: u16 = 23;

/// Uncompressed point format.
pub const POINT_FORMAT_UNCOMPRESSED: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionType {
    SupportedGroups,
    EcPointFormats,
    EcjpakeKeyKpPair,
    Unknown(u16),
}

impl Default for ExtensionType {
    fn default() -> Self {
        ExtensionType::Unknown(0xFFFF)
    }
}

impl ExtensionType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x000A => ExtensionType::SupportedGroups,
            0x000B => ExtensionType::EcPointFormats,
            0x0100 => ExtensionType::EcjpakeKeyKpPair,
            _ => ExtensionType::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ExtensionType::SupportedGroups => 0x000A,
            ExtensionType::EcPointFormats => 0x000B,
            ExtensionType::EcjpakeKeyKpPair => 0x0100,
            ExtensionType::Unknown(value) => *value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extension<'a> {
    pub extension_type: ExtensionType,
    pub extension_data: &'a [u8],
}

impl<'a> Extension<'a> {
    pub fn new(extension_type: ExtensionType, extension_data: &'a [u8]) -> Self {
        Extension {
            extension_type,
            extension_data,
        }
    }

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Extension<'a>> {
        let (input, extension_type) = be_u16(input)?;
        let (input, extension_length) = be_u16(input)?;
        let (input, extension_data) = take(extension_length)(input)?;

        Ok((
            input,
            Extension {
                extension_type: ExtensionType::from_u16(extension_type),
                extension_data,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(&self.extension_type.as_u16().to_be_bytes());
        output.extend_from_slice(&(self.extension_data.len() as u16).to_be_bytes());
        output.extend_from_slice(self.extension_data);
    }

    /// supported_groups listing only secp256r1.
    pub const SUPPORTED_GROUPS: &'static [u8] = &[0x00, 0x02, 0x00, NAMED_CURVE_SECP256R1 as u8];

    /// ec_point_formats listing only uncompressed.
    pub const POINT_FORMATS: &'static [u8] = &[0x01, POINT_FORMAT_UNCOMPRESSED];
}

type Extensions<'a> = ArrayVec<[Extension<'a>; 16]>;

fn parse_extensions(input: &[u8]) -> IResult<&[u8], Extensions<'_>> {
    let mut extensions = ArrayVec::new();

    // Extensions are optional.
    if input.is_empty() {
        return Ok((input, extensions));
    }

    let (input, extensions_len) = be_u16(input)?;
    let (input, mut data) = take(extensions_len)(input)?;

    while !data.is_empty() {
        let (rest, extension) = Extension::parse(data)?;
        if extensions.try_push(extension).is_some() {
            return Err(Err::Failure(Error::new(rest, ErrorKind::TooLarge)));
        }
        data = rest;
    }

    Ok((input, extensions))
}

fn serialize_extensions(extensions: &[Extension<'_>], output: &mut Vec<u8>) {
    if extensions.is_empty() {
        return;
    }
    let len_pos = output.len();
    output.extend_from_slice(&[0, 0]);
    for extension in extensions {
        extension.serialize(output);
    }
    let len = (output.len() - len_pos - 2) as u16;
    output[len_pos..len_pos + 2].copy_from_slice(&len.to_be_bytes());
}

fn find<'a, 'b>(extensions: &'b [Extension<'a>], wanted: ExtensionType) -> Option<&'b Extension<'a>> {
    extensions.iter().find(|e| e.extension_type == wanted)
}

impl Default for CipherSuite {
    fn default() -> Self {
        CipherSuite::Unknown(0)
    }
}

impl Default for CompressionMethod {
    fn default() -> Self {
        CompressionMethod::Null
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ClientHello<'a> {
    pub client_version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    pub cookie: Cookie,
    pub cipher_suites: ArrayVec<[CipherSuite; 32]>,
    pub compression_methods: ArrayVec<[CompressionMethod; 4]>,
    pub extensions: Extensions<'a>,
}

impl<'a> ClientHello<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], ClientHello<'a>> {
        let (input, client_version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = SessionId::parse(input)?;
        let (input, cookie) = Cookie::parse(input)?;

        let (input, cipher_suites_len) = be_u16(input)?;
        if cipher_suites_len % 2 != 0 {
            return Err(Err::Failure(Error::new(input, ErrorKind::LengthValue)));
        }
        let (input, mut suites_data) = take(cipher_suites_len)(input)?;
        let mut cipher_suites = ArrayVec::new();
        while !suites_data.is_empty() {
            let (rest, suite) = CipherSuite::parse(suites_data)?;
            // Offers beyond our capacity cannot contain anything new to us.
            let _ = cipher_suites.try_push(suite);
            suites_data = rest;
        }

        let (input, compression_len) = be_u8(input)?;
        let (input, mut compression_data) = take(compression_len)(input)?;
        let mut compression_methods = ArrayVec::new();
        while !compression_data.is_empty() {
            let (rest, method) = CompressionMethod::parse(compression_data)?;
            let _ = compression_methods.try_push(method);
            compression_data = rest;
        }

        let (input, extensions) = parse_extensions(input)?;

        Ok((
            input,
            ClientHello {
                client_version,
                random,
                session_id,
                cookie,
                cipher_suites,
                compression_methods,
                extensions,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        self.client_version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        self.cookie.serialize(output);
        output.extend_from_slice(&((self.cipher_suites.len() * 2) as u16).to_be_bytes());
        for suite in &self.cipher_suites {
            output.extend_from_slice(&suite.as_u16().to_be_bytes());
        }
        output.push(self.compression_methods.len() as u8);
        for method in &self.compression_methods {
            output.push(method.as_u8());
        }
        serialize_extensions(&self.extensions, output);
    }

    pub fn extension(&self, wanted: ExtensionType) -> Option<&Extension<'a>> {
        find(&self.extensions, wanted)
    }

    pub fn offers(&self, suite: CipherSuite) -> bool {
        self.cipher_suites.contains(&suite)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ServerHello<'a> {
    pub server_version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    pub cipher_suite: CipherSuite,
    pub compression_method: CompressionMethod,
    pub extensions: Extensions<'a>,
}

impl<'a> ServerHello<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], ServerHello<'a>> {
        let (input, server_version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = SessionId::parse(input)?;
        let (input, cipher_suite) = CipherSuite::parse(input)?;
        let (input, compression_method) = CompressionMethod::parse(input)?;
        let (input, extensions) = parse_extensions(input)?;

        Ok((
            input,
            ServerHello {
                server_version,
                random,
                session_id,
                cipher_suite,
                compression_method,
                extensions,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        self.server_version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        output.extend_from_slice(&self.cipher_suite.as_u16().to_be_bytes());
        output.push(self.compression_method.as_u8());
        serialize_extensions(&self.extensions, output);
    }

    pub fn extension(&self, wanted: ExtensionType) -> Option<&Extension<'a>> {
        find(&self.extensions, wanted)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct HelloVerifyRequest {
    pub server_version: ProtocolVersion,
    pub cookie: Cookie,
}

impl HelloVerifyRequest {
    pub fn parse(input: &[u8]) -> IResult<&[u8], HelloVerifyRequest> {
        let (input, server_version) = ProtocolVersion::parse(input)?;
        let (input, cookie) = Cookie::parse(input)?;
        Ok((
            input,
            HelloVerifyRequest {
                server_version,
                cookie,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        self.server_version.serialize(output);
        self.cookie.serialize(output);
    }
}
