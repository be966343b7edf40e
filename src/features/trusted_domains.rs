//! Allowlist of domain suffixes routine build traffic talks to.
//!
//! The extractor surfaces `external_url_count` as a raw count (every URL
//! matters for the model), but rule-based explanations and any future
//! allowlist-driven filtering need a way to tell "npm install reaching
//! registry.npmjs.org" apart from "curl piping to an unknown host" — this
//! table is that distinction. A suffix match is anchored on label
//! boundaries: `evil-github.com` must never match `github.com`.

const TRUSTED_SUFFIXES: &[&str] = &[
    // CI/CD platforms
    "github.com",
    "githubusercontent.com",
    "githubassets.com",
    "gitlab.com",
    "gitlab.io",
    "circleci.com",
    "travis-ci.org",
    "travis-ci.com",
    "jenkins.io",
    "buildkite.com",
    "dev.azure.com",
    "visualstudio.com",
    "appveyor.com",
    "teamcity.com",
    "bitbucket.org",
    "drone.io",
    "concourse-ci.org",
    "semaphoreci.com",
    "codeship.com",
    "tekton.dev",
    "spinnaker.io",
    "gocd.org",
    "woodpecker-ci.org",
    "harness.io",
    "codemagic.io",
    "bamboo.atlassian.com",
    "bitrise.io",
    // Package registries
    "npmjs.org",
    "npmjs.com",
    "pypi.org",
    "pythonhosted.org",
    "rubygems.org",
    "crates.io",
    "maven.apache.org",
    "repo.maven.apache.org",
    "repo1.maven.org",
    "nuget.org",
    "packagist.org",
    "golang.org",
    "pkg.go.dev",
    "proxy.golang.org",
    "sum.golang.org",
    "conda.io",
    "anaconda.org",
    "cocoapods.org",
    "conan.io",
    "hex.pm",
    "clojars.org",
    "packagecloud.io",
    "bintray.com",
    "jcenter.bintray.com",
    "sonatype.org",
    "central.sonatype.com",
    "gems.ruby-lang.org",
    // Container registries
    "docker.com",
    "docker.io",
    "ghcr.io",
    "quay.io",
    "gcr.io",
    "mcr.microsoft.com",
    "public.ecr.aws",
    "registry.k8s.io",
    "k8s.gcr.io",
    "harbor.io",
    "jfrog.io",
    "artifactory.jfrog.io",
    // Cloud providers
    "amazonaws.com",
    "azure.com",
    "azureedge.net",
    "googleapis.com",
    "googlecloud.com",
    "cloud.google.com",
    "digitalocean.com",
    "herokuapp.com",
    "herokucdn.com",
    "linode.com",
    "vultr.com",
    "ibm.com",
    "oraclecloud.com",
    "alibabacloud.com",
    "scaleway.com",
    "ovh.com",
    "render.com",
    "fly.io",
    "vercel.app",
    "netlify.app",
    "netlify.com",
    // CDNs
    "cloudflare.com",
    "cloudfront.net",
    "fastly.net",
    "jsdelivr.net",
    "unpkg.com",
    "akamai.net",
    "akamaized.net",
    "cdnjs.cloudflare.com",
    "bootstrapcdn.com",
    "statically.io",
    // Language runtimes and toolchains
    "nodejs.org",
    "python.org",
    "rust-lang.org",
    "static.rust-lang.org",
    "openjdk.org",
    "adoptium.net",
    "dot.net",
    "dotnet.microsoft.com",
    "ruby-lang.org",
    "php.net",
    "perl.org",
    "haskell.org",
    "elixir-lang.org",
    "erlang.org",
    "swift.org",
    "kotlinlang.org",
    "scala-lang.org",
    "julialang.org",
    "deno.land",
    "bun.sh",
    // Documentation and community hosts
    "readthedocs.io",
    "readthedocs.org",
    "stackoverflow.com",
    "docs.rs",
    "developer.mozilla.org",
    "wikipedia.org",
    "dev.to",
    "hashnode.dev",
    "confluence.atlassian.com",
    "notion.so",
    // Security scanning and code-quality services
    "snyk.io",
    "codecov.io",
    "coveralls.io",
    "sonarcloud.io",
    "sonarqube.org",
    "whitesourcesoftware.com",
    "blackducksoftware.com",
    "checkmarx.com",
    "sentry.io",
    "datadoghq.com",
];

/// Returns true if `host` matches a trusted suffix exactly, or is a proper
/// subdomain of one (`cache.npmjs.com` passes, `npmjs.com.evil.net` and
/// `evil-npmjs.com` do not).
pub fn is_trusted_domain(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();

    TRUSTED_SUFFIXES.iter().any(|suffix| {
        host == *suffix || host.ends_with(&format!(".{suffix}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_subdomain_match() {
        assert!(is_trusted_domain("github.com"));
        assert!(is_trusted_domain("api.github.com"));
        assert!(is_trusted_domain("Objects.githubusercontent.com"));
    }

    #[test]
    fn lookalike_domains_do_not_match() {
        assert!(!is_trusted_domain("evil-github.com"));
        assert!(!is_trusted_domain("github.com.evil.net"));
        assert!(!is_trusted_domain("notgithub.com"));
    }

    #[test]
    fn unrelated_domain_does_not_match() {
        assert!(!is_trusted_domain("pastebin.com"));
    }
}
