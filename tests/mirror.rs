use repocache::{Distro, MirrorSet};
use url::Url;

fn mirrors() -> MirrorSet {
    MirrorSet::new(
        Url::parse("http://deb.debian.org/debian/").unwrap(),
        Url::parse("http://archive.ubuntu.com/ubuntu/").unwrap(),
        Url::parse("http://mirror.centos.org/centos/").unwrap(),
    )
}

#[test]
fn rewrites_a_debian_path_against_the_configured_mirror() {
    let mirrors = mirrors();
    let url = mirrors.rewrite(Distro::Debian, "/debian/pool/main/foo.deb").unwrap();
    assert_eq!(url.as_str(), "http://deb.debian.org/debian/pool/main/foo.deb");
}

#[test]
fn centos_override_takes_precedence_over_the_default() {
    let mirrors = mirrors();
    mirrors.set_centos_mirror("cn:tsinghua");
    let url = mirrors.rewrite(Distro::CentOS, "/centos/8/os/x86_64/foo.rpm").unwrap();
    assert!(url.as_str().contains("tsinghua"));
}

#[test]
fn resetting_the_override_restores_the_default_mirror() {
    let mirrors = mirrors();
    mirrors.set_centos_mirror("cn:tsinghua");
    mirrors.reset_centos_mirror();
    let url = mirrors.rewrite(Distro::CentOS, "/centos/8/os/x86_64/foo.rpm").unwrap();
    assert!(url.as_str().contains("mirror.centos.org"));
}
