//! SOCKS5 method negotiation and RFC 1929 username/password authentication

use super::consts::*;
use super::types::AuthMethod;
use crate::error::Socks5Error;
use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read the client's method list and reply with the chosen method
///
/// Password is chosen when authentication is required and offered, no-auth
/// otherwise when offered. When neither fits `0xFF` is sent and an error
/// returned.
pub async fn negotiate_method<S>(stream: &mut S, auth_required: bool) -> Result<AuthMethod>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    let version = buf[0];
    let num_methods = buf[1];

    if version != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(version).into());
    }

    let mut methods = vec![0u8; num_methods as usize];
    stream.read_exact(&mut methods).await?;

    let selected = select_auth_method(&methods, auth_required);

    stream
        .write_all(&[
            SOCKS5_VERSION,
            selected
                .map(|m| m.to_byte())
                .unwrap_or(SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE),
        ])
        .await?;
    stream.flush().await?;

    selected.ok_or_else(|| Socks5Error::NoAcceptableMethod.into())
}

/// Pick a method from the offered list
pub fn select_auth_method(methods: &[u8], auth_required: bool) -> Option<AuthMethod> {
    if auth_required && methods.contains(&SOCKS5_AUTH_METHOD_PASSWORD) {
        return Some(AuthMethod::Password);
    }
    if methods.contains(&SOCKS5_AUTH_METHOD_NONE) {
        return Some(AuthMethod::None);
    }
    None
}

/// Read an RFC 1929 username/password request
///
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
///
/// Malformed requests are answered with a failure status before the error
/// is returned.
pub async fn read_credentials<S>(stream: &mut S) -> Result<(String, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    let version = buf[0];
    let username_len = buf[1] as usize;

    if version != SOCKS5_AUTH_VERSION {
        send_auth_status(stream, SOCKS5_AUTH_FAILURE).await?;
        bail!("Invalid auth version: {}", version);
    }

    if username_len == 0 {
        send_auth_status(stream, SOCKS5_AUTH_FAILURE).await?;
        bail!("Invalid username length: {}", username_len);
    }

    let mut username = vec![0u8; username_len];
    stream.read_exact(&mut username).await?;
    let username = String::from_utf8(username).with_context(|| "Invalid UTF-8 in username")?;

    let password_len = stream.read_u8().await? as usize;
    let mut password = vec![0u8; password_len];
    stream.read_exact(&mut password).await?;
    let password = String::from_utf8(password).with_context(|| "Invalid UTF-8 in password")?;

    Ok((username, password))
}

/// Send the sub-negotiation status
pub async fn send_auth_status<S: AsyncWrite + Unpin>(stream: &mut S, status: u8) -> Result<()> {
    stream.write_all(&[SOCKS5_AUTH_VERSION, status]).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_auth_request(username: &str, password: &str) -> Vec<u8> {
        let mut request = vec![SOCKS5_AUTH_VERSION, username.len() as u8];
        request.extend_from_slice(username.as_bytes());
        request.push(password.len() as u8);
        request.extend_from_slice(password.as_bytes());
        request
    }

    #[test]
    fn test_select_auth_method_no_auth_required() {
        let methods = vec![SOCKS5_AUTH_METHOD_NONE, SOCKS5_AUTH_METHOD_PASSWORD];
        assert_eq!(select_auth_method(&methods, false), Some(AuthMethod::None));

        let methods = vec![SOCKS5_AUTH_METHOD_PASSWORD];
        assert_eq!(select_auth_method(&methods, false), None);
    }

    #[test]
    fn test_select_auth_method_auth_required() {
        let methods = vec![SOCKS5_AUTH_METHOD_NONE, SOCKS5_AUTH_METHOD_PASSWORD];
        assert_eq!(
            select_auth_method(&methods, true),
            Some(AuthMethod::Password)
        );

        // Falls back to no-auth; the command is then refused
        let methods = vec![SOCKS5_AUTH_METHOD_NONE];
        assert_eq!(select_auth_method(&methods, true), Some(AuthMethod::None));

        assert_eq!(select_auth_method(&[0x01], true), None);
    }

    #[tokio::test]
    async fn test_negotiate_replies_selected_method() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(&[SOCKS5_VERSION, 2, SOCKS5_AUTH_METHOD_NONE, SOCKS5_AUTH_METHOD_PASSWORD])
            .await
            .unwrap();

        let method = negotiate_method(&mut server, true).await.unwrap();
        assert_eq!(method, AuthMethod::Password);

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [SOCKS5_VERSION, SOCKS5_AUTH_METHOD_PASSWORD]);
    }

    #[tokio::test]
    async fn test_negotiate_no_acceptable_method() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[SOCKS5_VERSION, 1, 0x01]).await.unwrap();

        let err = negotiate_method(&mut server, false).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Socks5Error>(),
            Some(Socks5Error::NoAcceptableMethod)
        ));

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE]);
    }

    #[tokio::test]
    async fn test_negotiate_bad_version() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0x04, 1, 0x00]).await.unwrap();
        assert!(negotiate_method(&mut server, false).await.is_err());
    }

    #[tokio::test]
    async fn test_read_credentials() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(&create_auth_request("admin", "secret123"))
            .await
            .unwrap();

        let (user, pass) = read_credentials(&mut server).await.unwrap();
        assert_eq!(user, "admin");
        assert_eq!(pass, "secret123");
    }

    #[tokio::test]
    async fn test_read_credentials_invalid_version() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut request = create_auth_request("user", "pass");
        request[0] = 0xFF;
        client.write_all(&request).await.unwrap();

        let result = read_credentials(&mut server).await;
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid auth version"));

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [SOCKS5_AUTH_VERSION, SOCKS5_AUTH_FAILURE]);
    }

    #[tokio::test]
    async fn test_read_credentials_zero_username_length() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(&[SOCKS5_AUTH_VERSION, 0, 4, b'p', b'a', b's', b's'])
            .await
            .unwrap();

        let result = read_credentials(&mut server).await;
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid username length"));
    }

    #[tokio::test]
    async fn test_password_exchange_scripted() {
        let mut stream = tokio_test::io::Builder::new()
            .read(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD])
            .write(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_PASSWORD])
            .read(&create_auth_request("bob", "pw"))
            .write(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_SUCCESS])
            .build();

        assert_eq!(
            negotiate_method(&mut stream, true).await.unwrap(),
            AuthMethod::Password
        );
        let (user, pass) = read_credentials(&mut stream).await.unwrap();
        assert_eq!((user.as_str(), pass.as_str()), ("bob", "pw"));
        send_auth_status(&mut stream, SOCKS5_AUTH_SUCCESS).await.unwrap();
    }
}
